//! C3 — pool store: the persisted, versioned form of a pool's reservations,
//! read-modify-written under optimistic concurrency control.
//!
//! Unlike the teacher's commit-DAG `VersionStore`, which always accepts the
//! newest write, `PoolStore::update` is a genuine compare-and-swap: it reads
//! the current version inside a single storage transaction, refuses to
//! commit if the caller's expected version has drifted, and surfaces that
//! as [`StorageError::Conflict`] for the orchestrator (C5) to retry.

use crate::allocate::Reservation;
use crate::error::{EngineError, EngineResult};
use crate::naming::PoolId;
use ipam_storage::{namespaced_key, KVStore, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReservationRecord {
    pub offset: String,
    pub pod_ref: String,
    pub container_id: String,
    pub interface_name: String,
}

impl From<&Reservation> for ReservationRecord {
    fn from(r: &Reservation) -> Self {
        Self {
            offset: r.offset.to_string(),
            pod_ref: r.pod_ref.clone(),
            container_id: r.container_id.clone(),
            interface_name: r.interface_name.clone(),
        }
    }
}

impl ReservationRecord {
    pub fn to_reservation(&self) -> EngineResult<Reservation> {
        let offset = self.offset.parse::<u128>().map_err(|_| {
            EngineError::Storage(StorageError::serialization_error(
                format!("corrupt offset '{}' in pool record", self.offset),
                None,
            ))
        })?;
        Ok(Reservation {
            offset,
            pod_ref: self.pod_ref.clone(),
            container_id: self.container_id.clone(),
            interface_name: self.interface_name.clone(),
        })
    }
}

/// The on-disk shape of a pool object (spec.md §3's `ip_pool` resource).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub cidr: String,
    pub reservations: Vec<ReservationRecord>,
    pub version: u64,
}

impl PoolRecord {
    fn empty(cidr: &str) -> Self {
        Self {
            cidr: cidr.to_string(),
            reservations: Vec::new(),
            version: 0,
        }
    }

    pub fn reservations_by_offset(&self) -> EngineResult<HashMap<u128, Reservation>> {
        self.reservations
            .iter()
            .map(|r| r.to_reservation().map(|res| (res.offset, res)))
            .collect()
    }
}

/// C3 over a generic [`KVStore`]. Namespace matches `WHEREABOUTS_NAMESPACE`
/// (spec.md §6), default `kube-system`.
pub struct PoolStore<S: KVStore> {
    store: Arc<S>,
    namespace: String,
}

impl<S: KVStore> PoolStore<S> {
    pub fn new(store: Arc<S>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn key(&self, id: &PoolId) -> String {
        namespaced_key(&self.namespace, "pool", &id.canonical_name())
    }

    /// Fetch the pool record, creating an empty (version 0) one in memory
    /// if it does not yet exist in storage. The empty record is not
    /// persisted until the caller calls [`PoolStore::update`].
    pub fn get_or_create(&self, id: &PoolId) -> EngineResult<PoolRecord> {
        let key = self.key(id);
        match self.store.get(key.as_bytes())? {
            Some(bytes) => {
                let record: PoolRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::serialization_error(e.to_string(), Some(Box::new(e))))?;
                Ok(record)
            }
            None => Ok(PoolRecord::empty(&id.range)),
        }
    }

    /// Compare-and-swap write: `expected_version` must match the version
    /// currently in storage (0 meaning "does not exist yet"), evaluated
    /// inside a single transaction against the backend.
    pub fn update(
        &self,
        id: &PoolId,
        expected_version: u64,
        reservations: Vec<ReservationRecord>,
    ) -> EngineResult<PoolRecord> {
        let key = self.key(id);
        let mut txn = self.store.transaction()?;

        let current_version = match txn.get(key.as_bytes())? {
            Some(bytes) => {
                let existing: PoolRecord = serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::serialization_error(e.to_string(), Some(Box::new(e)))
                })?;
                existing.version
            }
            None => 0,
        };

        if current_version != expected_version {
            txn.rollback()?;
            return Err(EngineError::Storage(StorageError::conflict(
                key,
                expected_version,
                current_version,
            )));
        }

        let new_record = PoolRecord {
            cidr: id.range.clone(),
            reservations,
            version: expected_version + 1,
        };
        let encoded = serde_json::to_vec(&new_record)
            .map_err(|e| StorageError::serialization_error(e.to_string(), Some(Box::new(e))))?;
        txn.put(key.as_bytes(), &encoded)?;
        txn.commit()?;

        Ok(new_record)
    }

    pub fn delete(&self, id: &PoolId) -> EngineResult<()> {
        self.store.delete(self.key(id).as_bytes())?;
        Ok(())
    }

    /// CAS write addressed by the pool's already-canonical storage name
    /// rather than a [`PoolId`] — used by C8, which discovers pools by
    /// scanning storage and only has the (already-encoded) name on hand.
    pub fn update_by_name(
        &self,
        name: &str,
        expected_version: u64,
        reservations: Vec<ReservationRecord>,
    ) -> EngineResult<PoolRecord> {
        let key = namespaced_key(&self.namespace, "pool", name);
        let mut txn = self.store.transaction()?;

        let current = match txn.get(key.as_bytes())? {
            Some(bytes) => {
                let existing: PoolRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::serialization_error(e.to_string(), Some(Box::new(e))))?;
                Some(existing)
            }
            None => None,
        };
        let current_version = current.as_ref().map(|r| r.version).unwrap_or(0);

        if current_version != expected_version {
            txn.rollback()?;
            return Err(EngineError::Storage(StorageError::conflict(
                key,
                expected_version,
                current_version,
            )));
        }

        let cidr = current.map(|r| r.cidr).unwrap_or_default();
        let new_record = PoolRecord {
            cidr,
            reservations,
            version: expected_version + 1,
        };
        let encoded = serde_json::to_vec(&new_record)
            .map_err(|e| StorageError::serialization_error(e.to_string(), Some(Box::new(e))))?;
        txn.put(key.as_bytes(), &encoded)?;
        txn.commit()?;

        Ok(new_record)
    }

    pub fn list_ids(&self) -> EngineResult<Vec<String>> {
        let prefix = format!("{}/pool/", self.namespace);
        let keys = self.store.keys_with_prefix(prefix.as_bytes())?;
        Ok(keys
            .into_iter()
            .filter_map(|k| String::from_utf8(k.to_vec()).ok())
            .collect())
    }

    /// All pool records currently in storage, keyed by their canonical
    /// name (the last path segment of the storage key) — used by C8's
    /// full-scan reconcile pass.
    pub fn list_all(&self) -> EngineResult<Vec<(String, PoolRecord)>> {
        let prefix = format!("{}/pool/", self.namespace);
        let rows = self.store.scan(prefix.as_bytes())?;
        rows.into_iter()
            .map(|(key, value)| {
                let name = String::from_utf8_lossy(&key).rsplit('/').next().unwrap_or_default().to_string();
                let record: PoolRecord = serde_json::from_slice(&value).map_err(|e| {
                    EngineError::Storage(StorageError::serialization_error(
                        e.to_string(),
                        Some(Box::new(e)),
                    ))
                })?;
                Ok((name, record))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_storage::RedbBackend;
    use tempfile::TempDir;

    fn store() -> (TempDir, Arc<RedbBackend>) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        (dir, backend)
    }

    #[test]
    fn test_get_or_create_returns_empty_for_missing_pool() {
        let (_dir, backend) = store();
        let ps = PoolStore::new(backend, "kube-system");
        let id = PoolId::new("10.10.0.0/16");
        let record = ps.get_or_create(&id).unwrap();
        assert_eq!(record.version, 0);
        assert!(record.reservations.is_empty());
    }

    #[test]
    fn test_update_then_roundtrip() {
        let (_dir, backend) = store();
        let ps = PoolStore::new(backend, "kube-system");
        let id = PoolId::new("10.10.0.0/16");
        let rec = ps
            .update(
                &id,
                0,
                vec![ReservationRecord {
                    offset: "1".into(),
                    pod_ref: "default/pod-a".into(),
                    container_id: "cid".into(),
                    interface_name: "eth0".into(),
                }],
            )
            .unwrap();
        assert_eq!(rec.version, 1);

        let fetched = ps.get_or_create(&id).unwrap();
        assert_eq!(fetched.version, 1);
        assert_eq!(fetched.reservations.len(), 1);
    }

    #[test]
    fn test_update_rejects_stale_version() {
        let (_dir, backend) = store();
        let ps = PoolStore::new(backend, "kube-system");
        let id = PoolId::new("10.10.0.0/16");
        ps.update(&id, 0, vec![]).unwrap();

        let err = ps.update(&id, 0, vec![]).unwrap_err();
        match err {
            EngineError::Storage(StorageError::Conflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_update_succeeds_with_correct_version_after_conflict() {
        let (_dir, backend) = store();
        let ps = PoolStore::new(backend, "kube-system");
        let id = PoolId::new("10.10.0.0/16");
        let first = ps.update(&id, 0, vec![]).unwrap();
        let second = ps.update(&id, first.version, vec![]).unwrap();
        assert_eq!(second.version, 2);
    }
}
