//! C6 — node-slice controller: partitions a parent range into per-node
//! sub-ranges so that nodes never contend for the same addresses (spec.md
//! §4.6). Reconciliation is level-triggered and idempotent; it never relies
//! on observing every intermediate event from the event bus.

use crate::error::{ControllerError, Result};
use ipam_engine::{divide, CidrRange};
use ipam_storage::{namespaced_key, KVStore, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SliceAllocation {
    pub slice_range: String,
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSlicePoolRecord {
    pub network_name: String,
    pub range: String,
    pub slice_size: u8,
    pub allocations: Vec<SliceAllocation>,
    pub primary_owner: String,
    pub auxiliary_owners: Vec<String>,
    pub version: u64,
}

pub struct NodeSliceStore<S: KVStore> {
    store: Arc<S>,
    namespace: String,
}

impl<S: KVStore> NodeSliceStore<S> {
    pub fn new(store: Arc<S>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn key(&self, network_name: &str) -> String {
        namespaced_key(&self.namespace, "nodeslice", network_name)
    }

    pub fn get(&self, network_name: &str) -> Result<Option<NodeSlicePoolRecord>> {
        match self.store.get(self.key(network_name).as_bytes())? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn update(
        &self,
        network_name: &str,
        expected_version: u64,
        record: NodeSlicePoolRecord,
    ) -> Result<NodeSlicePoolRecord> {
        let key = self.key(network_name);
        let mut txn = self.store.transaction()?;

        let current_version = match txn.get(key.as_bytes())? {
            Some(bytes) => {
                let existing: NodeSlicePoolRecord = serde_json::from_slice(&bytes)?;
                existing.version
            }
            None => 0,
        };

        if current_version != expected_version {
            txn.rollback()?;
            return Err(ControllerError::Engine(ipam_engine::EngineError::Storage(
                StorageError::conflict(key, expected_version, current_version),
            )));
        }

        let mut record = record;
        record.version = expected_version + 1;
        let encoded = serde_json::to_vec(&record)?;
        txn.put(key.as_bytes(), &encoded)?;
        txn.commit()?;
        Ok(record)
    }

    /// Ensure a `NodeSlicePool` exists for `network_name` with exactly this
    /// `(range, slice_size)`, creating it (and its `subnets`) on first call
    /// and recomputing if the stored one has drifted. `owner_ref` is
    /// recorded as the primary owner on creation, or added as an auxiliary
    /// owner if a matching pool already exists under a different primary.
    pub fn ensure_pool(
        &self,
        network_name: &str,
        range: &CidrRange,
        slice_size: u8,
        owner_ref: &str,
    ) -> Result<NodeSlicePoolRecord> {
        match self.get(network_name)? {
            None => {
                let subnets = divide(range, slice_size)?;
                let allocations = subnets
                    .into_iter()
                    .map(|s| SliceAllocation {
                        slice_range: s.to_cidr_string(),
                        node_name: None,
                    })
                    .collect();
                let record = NodeSlicePoolRecord {
                    network_name: network_name.to_string(),
                    range: range.to_cidr_string(),
                    slice_size,
                    allocations,
                    primary_owner: owner_ref.to_string(),
                    auxiliary_owners: Vec::new(),
                    version: 0,
                };
                info!(network_name, "creating NodeSlicePool");
                self.update(network_name, 0, record)
            }
            Some(existing) => {
                if existing.range != range.to_cidr_string() || existing.slice_size != slice_size {
                    return Err(ControllerError::NodeSliceMismatch {
                        network_name: network_name.to_string(),
                    });
                }
                if existing.primary_owner == owner_ref
                    || existing.auxiliary_owners.iter().any(|o| o == owner_ref)
                {
                    return Ok(existing);
                }
                let mut updated = existing.clone();
                updated.auxiliary_owners.push(owner_ref.to_string());
                let version = existing.version;
                self.update(network_name, version, updated)
            }
        }
    }

    /// Deterministically assign `node_name` to the first unassigned slice,
    /// ordered by slice address ascending. Idempotent: a node that already
    /// holds a slice gets that slice back unchanged.
    pub fn assign_node(&self, network_name: &str, node_name: &str) -> Result<CidrRange> {
        let record = self
            .get(network_name)?
            .ok_or_else(|| ControllerError::not_found(format!("NodeSlicePool {}", network_name)))?;

        if let Some(existing) = record
            .allocations
            .iter()
            .find(|a| a.node_name.as_deref() == Some(node_name))
        {
            return CidrRange::parse(&existing.slice_range).map_err(Into::into);
        }

        let mut updated = record.clone();
        let slot = updated
            .allocations
            .iter_mut()
            .find(|a| a.node_name.is_none())
            .ok_or_else(|| ControllerError::no_slice_for_node(node_name))?;
        slot.node_name = Some(node_name.to_string());
        let slice = CidrRange::parse(&slot.slice_range)?;

        self.update(network_name, record.version, updated)?;
        Ok(slice)
    }

    /// Clear `node_name` from its allocation, retaining the slice entry so
    /// operators can still observe the historical layout. The slice becomes
    /// reusable by the next `assign_node` call.
    pub fn unassign_node(&self, network_name: &str, node_name: &str) -> Result<()> {
        let record = self
            .get(network_name)?
            .ok_or_else(|| ControllerError::not_found(format!("NodeSlicePool {}", network_name)))?;

        if !record
            .allocations
            .iter()
            .any(|a| a.node_name.as_deref() == Some(node_name))
        {
            return Ok(());
        }

        let mut updated = record.clone();
        for a in updated.allocations.iter_mut() {
            if a.node_name.as_deref() == Some(node_name) {
                a.node_name = None;
            }
        }
        self.update(network_name, record.version, updated)?;
        Ok(())
    }

    /// Subtract `owner_ref` from this `NodeSlicePool`'s owner set (spec.md
    /// §4.6, §9's cyclic-ownership note): removing the primary promotes the
    /// first remaining auxiliary owner to primary; removing the last owner
    /// deletes the object. A no-op if `owner_ref` holds no ref here.
    pub fn remove_owner(&self, network_name: &str, owner_ref: &str) -> Result<()> {
        let Some(record) = self.get(network_name)? else {
            return Ok(());
        };

        if record.primary_owner != owner_ref && !record.auxiliary_owners.iter().any(|o| o == owner_ref) {
            return Ok(());
        }

        let mut updated = record.clone();
        updated.auxiliary_owners.retain(|o| o != owner_ref);

        if record.primary_owner == owner_ref {
            if updated.auxiliary_owners.is_empty() {
                let key = self.key(network_name);
                self.store.delete(key.as_bytes())?;
                info!(network_name, "deleted NodeSlicePool, last owner removed");
                return Ok(());
            }
            updated.primary_owner = updated.auxiliary_owners.remove(0);
        }

        self.update(network_name, record.version, updated)?;
        Ok(())
    }

    pub fn slice_for_node(&self, network_name: &str, node_name: &str) -> Result<Option<CidrRange>> {
        let Some(record) = self.get(network_name)? else {
            return Ok(None);
        };
        record
            .allocations
            .iter()
            .find(|a| a.node_name.as_deref() == Some(node_name))
            .map(|a| CidrRange::parse(&a.slice_range).map_err(Into::into))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_storage::RedbBackend;
    use tempfile::TempDir;

    fn store() -> (TempDir, NodeSliceStore<RedbBackend>) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        (dir, NodeSliceStore::new(backend, "kube-system"))
    }

    #[test]
    fn test_ensure_pool_creates_subnets() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        let record = s.ensure_pool("net1", &range, 20, "attach-a").unwrap();
        assert_eq!(record.allocations.len(), 1 << 12);
        assert_eq!(record.primary_owner, "attach-a");
    }

    #[test]
    fn test_ensure_pool_adds_auxiliary_owner_on_agreement() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-a").unwrap();
        let record = s.ensure_pool("net1", &range, 20, "attach-b").unwrap();
        assert_eq!(record.auxiliary_owners, vec!["attach-b".to_string()]);
    }

    #[test]
    fn test_ensure_pool_rejects_mismatched_slice_size() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-a").unwrap();
        let err = s.ensure_pool("net1", &range, 24, "attach-b").unwrap_err();
        assert!(matches!(err, ControllerError::NodeSliceMismatch { .. }));
    }

    #[test]
    fn test_assign_node_picks_first_unassigned_slice_ascending() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-a").unwrap();

        let n1 = s.assign_node("net1", "n1").unwrap();
        let n2 = s.assign_node("net1", "n2").unwrap();

        assert_eq!(n1.to_cidr_string(), "10.0.0.0/20");
        assert_eq!(n2.to_cidr_string(), "10.0.16.0/20");
    }

    #[test]
    fn test_assign_node_is_idempotent() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-a").unwrap();

        let a = s.assign_node("net1", "n1").unwrap();
        let b = s.assign_node("net1", "n1").unwrap();
        assert_eq!(a.to_cidr_string(), b.to_cidr_string());
    }

    #[test]
    fn test_unassign_node_frees_slice_for_reuse() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/30").unwrap();
        s.ensure_pool("net1", &range, 31, "attach-a").unwrap();

        let n1 = s.assign_node("net1", "n1").unwrap();
        s.unassign_node("net1", "n1").unwrap();
        let n2 = s.assign_node("net1", "n2").unwrap();

        assert_eq!(n1.to_cidr_string(), n2.to_cidr_string());
        assert!(s.slice_for_node("net1", "n1").unwrap().is_none());
    }

    #[test]
    fn test_no_slice_for_node_when_exhausted() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/30").unwrap();
        s.ensure_pool("net1", &range, 31, "attach-a").unwrap();

        s.assign_node("net1", "n1").unwrap();
        s.assign_node("net1", "n2").unwrap();
        let err = s.assign_node("net1", "n3").unwrap_err();
        assert!(matches!(err, ControllerError::NoSliceForNode { .. }));
    }

    #[test]
    fn test_remove_owner_deletes_pool_when_primary_is_last_owner() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-a").unwrap();

        s.remove_owner("net1", "attach-a").unwrap();

        assert!(s.get("net1").unwrap().is_none());
    }

    #[test]
    fn test_remove_owner_promotes_auxiliary_when_primary_removed() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-a").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-b").unwrap();

        s.remove_owner("net1", "attach-a").unwrap();

        let record = s.get("net1").unwrap().unwrap();
        assert_eq!(record.primary_owner, "attach-b");
        assert!(record.auxiliary_owners.is_empty());
    }

    #[test]
    fn test_remove_owner_on_auxiliary_leaves_pool_intact() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-a").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-b").unwrap();

        s.remove_owner("net1", "attach-b").unwrap();

        let record = s.get("net1").unwrap().unwrap();
        assert_eq!(record.primary_owner, "attach-a");
        assert!(record.auxiliary_owners.is_empty());
    }

    #[test]
    fn test_remove_owner_unknown_ref_is_a_no_op() {
        let (_dir, s) = store();
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        s.ensure_pool("net1", &range, 20, "attach-a").unwrap();

        s.remove_owner("net1", "attach-ghost").unwrap();

        assert!(s.get("net1").unwrap().is_some());
    }
}
