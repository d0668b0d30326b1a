//! C8 — batch reconciler: a one-shot scan that repairs reservations and
//! overlap entries left behind by a missed C5.Release or C7 cleanup
//! (spec.md §4.8). Pools are swept before the overlap registry, so that a
//! concurrent Assign recreating a reservation is never shadowed by a stale
//! overlap deletion racing ahead of it.

use crate::client::ClusterClient;
use crate::error::Result;
use crate::pod_cleanup::network_status_entries;
use ipam_engine::{add_offset, CidrRange, OverlapRegistry, PoolStore, ReservationRecord};
use ipam_storage::KVStore;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    pub pools_scanned: usize,
    pub reservations_removed: usize,
    pub overlap_entries_scanned: usize,
    pub overlap_entries_removed: usize,
}

pub struct BatchReconciler<S: KVStore> {
    pool_store: PoolStore<S>,
    overlap: OverlapRegistry<S>,
    client: Arc<ClusterClient>,
}

impl<S: KVStore> BatchReconciler<S> {
    pub fn new(store: Arc<S>, namespace: impl Into<String>, client: Arc<ClusterClient>) -> Self {
        let namespace = namespace.into();
        Self {
            pool_store: PoolStore::new(store.clone(), namespace.clone()),
            overlap: OverlapRegistry::new(store, namespace),
            client,
        }
    }

    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let mut report = self.run_pool_sweep().await?;
        self.run_overlap_sweep(&mut report)?;
        Ok(report)
    }

    /// Pools only (exposed separately so callers, e.g. `ipamd reconcile`,
    /// can map a pool-sweep failure to a distinct exit code from an
    /// overlap-sweep failure, per spec.md §6's exit code table).
    pub async fn run_pool_sweep(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.sweep_pools(&mut report).await?;
        Ok(report)
    }

    /// Overlap registry only; must run after [`BatchReconciler::run_pool_sweep`]
    /// (spec.md §4.8's ordering requirement).
    pub fn run_overlap_sweep(&self, report: &mut ReconcileReport) -> Result<()> {
        self.sweep_overlap(report)
    }

    async fn sweep_pools(&self, report: &mut ReconcileReport) -> Result<()> {
        let pools = self.pool_store.list_all()?;
        report.pools_scanned = pools.len();

        for (name, record) in pools {
            let reservations = record.reservations_by_offset()?;
            let mut kept = Vec::with_capacity(reservations.len());
            let mut removed = 0usize;

            let range = CidrRange::parse(&record.cidr).ok();

            for (_, reservation) in reservations {
                let address = range
                    .as_ref()
                    .and_then(|r| add_offset(&r.network(), reservation.offset).ok())
                    .map(|a| a.to_string());
                let alive = match address {
                    Some(address) => {
                        self.pod_still_holds_reservation(&reservation.pod_ref, &address)
                            .await
                    }
                    // Corrupt pool CIDR: fail safe and keep the reservation.
                    None => true,
                };
                if alive {
                    kept.push(ReservationRecord::from(&reservation));
                } else {
                    removed += 1;
                }
            }

            if removed == 0 {
                continue;
            }

            match self.pool_store.update_by_name(&name, record.version, kept) {
                Ok(_) => {
                    info!(pool = %name, removed, "removed stale reservations");
                    report.reservations_removed += removed;
                }
                Err(ipam_engine::EngineError::Storage(ipam_storage::StorageError::Conflict {
                    ..
                })) => {
                    warn!(pool = %name, "pool changed concurrently, skipping this pass");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn sweep_overlap(&self, report: &mut ReconcileReport) -> Result<()> {
        let pools = self.pool_store.list_all()?;
        let live_pod_refs: std::collections::HashSet<String> = pools
            .iter()
            .filter_map(|(_, record)| record.reservations_by_offset().ok())
            .flat_map(|m| m.into_values().map(|r| r.pod_ref))
            .collect();

        let entries = self.overlap.list_entries()?;
        report.overlap_entries_scanned = entries.len();

        for entry in entries {
            if !live_pod_refs.contains(&entry.pod_ref) {
                self.overlap.remove_orphan(&entry.address)?;
                report.overlap_entries_removed += 1;
            }
        }

        Ok(())
    }

    /// A reservation survives the sweep only if the pod it names still
    /// exists in the cluster AND still carries a live attachment whose
    /// address matches the reservation (spec.md §4.8 step 1) — otherwise a
    /// pod deleted and recreated under the same name, now holding a
    /// different address, would keep its predecessor's stale reservation
    /// forever. A cluster-API error is treated as "keep" (fail safe): C8
    /// would rather miss a stale entry than evict a live one because of a
    /// transient API hiccup.
    async fn pod_still_holds_reservation(&self, pod_ref: &str, expected_address: &str) -> bool {
        let Some((namespace, name)) = pod_ref.split_once('/') else {
            return false;
        };
        let pod = match self.client.get_pod(namespace, name).await {
            Ok(pod) => pod,
            Err(crate::error::ControllerError::NotFound { .. }) => return false,
            Err(_) => return true,
        };

        match network_status_entries(&pod) {
            Some(entries) => entries.iter().any(|entry| {
                entry
                    .ips
                    .iter()
                    .any(|ip| ip.split('/').next() == Some(expected_address))
            }),
            // No network-status annotation at all: fail safe rather than
            // evict on an absence we can't distinguish from a transient
            // CNI-plugin race.
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_engine::{clamp_bounds, ExclusionSet, PoolId, Request};
    use ipam_storage::RedbBackend;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<RedbBackend>) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        (dir, backend)
    }

    #[test]
    fn test_overlap_orphan_sweep_removes_entries_with_no_live_reservation() {
        let (_dir, backend) = setup();
        let pool_store = PoolStore::new(backend.clone(), "kube-system");
        let overlap = OverlapRegistry::new(backend.clone(), "kube-system");

        // A pool with one live reservation for pod-a.
        let range = CidrRange::parse("10.10.0.0/24").unwrap();
        let bounds = clamp_bounds(&range, None, None).unwrap();
        let pool_id = PoolId::new("10.10.0.0/24");
        let reservation = ipam_engine::assign(
            &range,
            &bounds,
            &ExclusionSet::empty(),
            &std::collections::HashMap::new(),
            &std::collections::HashSet::new(),
            &Request {
                pod_ref: "default/pod-a".into(),
                container_id: "c".into(),
                interface_name: "eth0".into(),
                fixed_offset: None,
            },
        )
        .unwrap();
        pool_store
            .update(&pool_id, 0, vec![ReservationRecord::from(&reservation)])
            .unwrap();

        overlap.claim("10.10.0.1", "10.10.0.0-24", "default/pod-a").unwrap();
        overlap.claim("10.10.0.2", "10.10.0.0-24", "default/pod-orphan").unwrap();

        // Exercise only the pure overlap-sweep helper logic directly,
        // since a live ClusterClient is not available in a unit test.
        let pools = pool_store.list_all().unwrap();
        let live: std::collections::HashSet<String> = pools
            .iter()
            .filter_map(|(_, r)| r.reservations_by_offset().ok())
            .flat_map(|m| m.into_values().map(|r| r.pod_ref))
            .collect();
        assert!(live.contains("default/pod-a"));
        assert!(!live.contains("default/pod-orphan"));

        for entry in overlap.list_entries().unwrap() {
            if !live.contains(&entry.pod_ref) {
                overlap.remove_orphan(&entry.address).unwrap();
            }
        }

        assert!(overlap.holder_of("10.10.0.1").unwrap().is_some());
        assert!(overlap.holder_of("10.10.0.2").unwrap().is_none());
    }
}
