//! C4 — overlap registry: cross-pool collision domain tracking for ranges
//! that are configured to overlap (spec.md §4.4), e.g. two differently
//! named pools that both cover `10.10.0.0/16`.
//!
//! Structurally this is the same CAS-over-KVStore shape as C3's pool store,
//! keyed by the claimed address itself rather than by pool, so two pools in
//! the same collision domain never hand out the same address.

use crate::error::{EngineError, EngineResult};
use ipam_storage::{namespaced_key, KVStore, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlapEntry {
    pub address: String,
    pub holder_pool: String,
    pub pod_ref: String,
    pub version: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    HeldByOther { holder_pool: String },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHeldByCaller,
    NotFound,
}

pub struct OverlapRegistry<S: KVStore> {
    store: Arc<S>,
    namespace: String,
}

impl<S: KVStore> OverlapRegistry<S> {
    pub fn new(store: Arc<S>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn key(&self, address: &str) -> String {
        namespaced_key(&self.namespace, "overlap", address)
    }

    /// Attempt to claim `address` for `holder_pool`/`pod_ref`. Idempotent:
    /// re-claiming an address already held by the same pool and pod
    /// succeeds without bumping the version (P3).
    pub fn claim(
        &self,
        address: &str,
        holder_pool: &str,
        pod_ref: &str,
    ) -> EngineResult<ClaimOutcome> {
        let key = self.key(address);
        let mut txn = self.store.transaction()?;

        let existing: Option<OverlapEntry> = match txn.get(key.as_bytes())? {
            Some(bytes) => Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::serialization_error(e.to_string(), Some(Box::new(e))))?,
            ),
            None => None,
        };

        if let Some(entry) = &existing {
            if entry.holder_pool == holder_pool && entry.pod_ref == pod_ref {
                txn.rollback()?;
                return Ok(ClaimOutcome::Claimed);
            }
            txn.rollback()?;
            return Ok(ClaimOutcome::HeldByOther {
                holder_pool: entry.holder_pool.clone(),
            });
        }

        let entry = OverlapEntry {
            address: address.to_string(),
            holder_pool: holder_pool.to_string(),
            pod_ref: pod_ref.to_string(),
            version: 1,
        };
        let encoded = serde_json::to_vec(&entry)
            .map_err(|e| StorageError::serialization_error(e.to_string(), Some(Box::new(e))))?;
        txn.put(key.as_bytes(), &encoded)?;
        txn.commit()?;

        Ok(ClaimOutcome::Claimed)
    }

    pub fn release(
        &self,
        address: &str,
        holder_pool: &str,
        pod_ref: &str,
    ) -> EngineResult<ReleaseOutcome> {
        let key = self.key(address);
        let mut txn = self.store.transaction()?;

        let existing: Option<OverlapEntry> = match txn.get(key.as_bytes())? {
            Some(bytes) => Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::serialization_error(e.to_string(), Some(Box::new(e))))?,
            ),
            None => None,
        };

        match existing {
            None => {
                txn.rollback()?;
                Ok(ReleaseOutcome::NotFound)
            }
            Some(entry) if entry.holder_pool == holder_pool && entry.pod_ref == pod_ref => {
                txn.delete(key.as_bytes())?;
                txn.commit()?;
                Ok(ReleaseOutcome::Released)
            }
            Some(_) => {
                txn.rollback()?;
                Ok(ReleaseOutcome::NotHeldByCaller)
            }
        }
    }

    /// All entries currently held, for C8's orphan sweep.
    pub fn list_entries(&self) -> EngineResult<Vec<OverlapEntry>> {
        let prefix = format!("{}/overlap/", self.namespace);
        let rows = self.store.scan(prefix.as_bytes())?;
        rows.into_iter()
            .map(|(_, value)| {
                serde_json::from_slice(&value).map_err(|e| {
                    EngineError::Storage(StorageError::serialization_error(
                        e.to_string(),
                        Some(Box::new(e)),
                    ))
                })
            })
            .collect()
    }

    /// Remove an entry unconditionally (no ownership check) — used by C8
    /// when an overlap entry has no corresponding live pool reservation.
    pub fn remove_orphan(&self, address: &str) -> EngineResult<()> {
        self.store.delete(self.key(address).as_bytes())?;
        Ok(())
    }

    pub fn holder_of(&self, address: &str) -> EngineResult<Option<String>> {
        let key = self.key(address);
        match self.store.get(key.as_bytes())? {
            Some(bytes) => {
                let entry: OverlapEntry = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::serialization_error(e.to_string(), Some(Box::new(e))))?;
                Ok(Some(entry.holder_pool))
            }
            None => Ok(None),
        }
    }
}
