//! C5 — the IPAM orchestrator: turns a CNI ADD/DEL into a retried,
//! CAS-guarded read-modify-write against the pool store and overlap
//! registry (spec.md §4.5).

use crate::error::{ControllerError, Result};
use ipam_engine::{
    assign, release, release_by_pod_ref, Bounds, CidrRange, ClaimOutcome, ExclusionSet,
    OverlapRegistry, PoolId, PoolStore, Reservation, ReservationRecord, Request,
};
use ipam_storage::KVStore;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Mirrors the CNI `NetConf`'s `leader_*` timing knobs (spec.md §6). No
/// leader election happens at this layer — these three numbers just bound
/// how long and how often an `assign`/`release` retries under CAS conflict,
/// per Open Question #3 in DESIGN.md.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    pub max_attempts: u32,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_millis(1500),
            renew_deadline: Duration::from_millis(1000),
            retry_period: Duration::from_millis(500),
            max_attempts: 2,
        }
    }
}

impl RetryBudget {
    /// Jittered delay before the next attempt: `retry_period` plus up to
    /// 20% jitter, so that competing nodes racing on the same pool don't
    /// retry in lockstep.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_period.as_millis() as u64;
        let jitter_max = base / 5;
        let jitter = if jitter_max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_max)
        };
        Duration::from_millis(base.saturating_mul(attempt as u64 + 1) + jitter)
    }
}

pub struct Orchestrator<S: KVStore> {
    pool_store: PoolStore<S>,
    overlap: OverlapRegistry<S>,
}

impl<S: KVStore> Orchestrator<S> {
    pub fn new(store: Arc<S>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            pool_store: PoolStore::new(store.clone(), namespace.clone()),
            overlap: OverlapRegistry::new(store, namespace),
        }
    }

    /// Assign an address from `range` for `request`, retrying under CAS
    /// conflict or a lost collision-domain race up to `budget.max_attempts`
    /// times (spec.md §4.5 steps 3-5). Collision-domain pools sharing this
    /// range are checked via the overlap registry both while scanning for a
    /// candidate (step 4) and after committing the reservation (step 5); a
    /// collision only surfaces as [`ControllerError::CollisionDomainHeld`]
    /// once the retry budget is exhausted.
    pub async fn assign_address(
        &self,
        pool_id: &PoolId,
        range: &CidrRange,
        bounds: &Bounds,
        exclusions: &ExclusionSet,
        collision_domain: Option<&str>,
        request: &Request,
    ) -> Result<Reservation> {
        let mut attempt = 0;
        loop {
            let pool = self.pool_store.get_or_create(pool_id)?;
            let reserved = pool.reservations_by_offset()?;

            // P3: a pod re-requesting the interface it already holds gets
            // back the same reservation instead of a fresh one.
            if let Some(existing) = reserved.values().find(|r| {
                r.pod_ref == request.pod_ref
                    && r.container_id == request.container_id
                    && r.interface_name == request.interface_name
            }) {
                debug!(pod_ref = %request.pod_ref, offset = existing.offset, "idempotent re-assign");
                return Ok(existing.clone());
            }

            // Step 4: iterate candidates via C2, peeking C4 for each one; a
            // candidate another pool in this collision domain already holds
            // is marked reserved-for-this-call and the scan continues.
            let mut also_reserved: HashSet<u128> = HashSet::new();
            let candidate = loop {
                let attempt_candidate =
                    assign(range, bounds, exclusions, &reserved, &also_reserved, request)?;
                let Some(_domain) = collision_domain else {
                    break attempt_candidate;
                };
                let address = ipam_engine::add_offset(&range.network(), attempt_candidate.offset)?;
                match self.overlap.holder_of(&address.to_string())? {
                    Some(holder) if holder != pool_id.canonical_name() => {
                        also_reserved.insert(attempt_candidate.offset);
                        continue;
                    }
                    _ => break attempt_candidate,
                }
            };

            let mut records: Vec<ReservationRecord> =
                reserved.values().map(ReservationRecord::from).collect();
            records.push(ReservationRecord::from(&candidate));

            // Step 5: commit the reservation first, then best-effort claim
            // the overlap entry. Losing that race rolls the reservation
            // back and restarts the whole attempt rather than failing hard.
            match self.pool_store.update(pool_id, pool.version, records.clone()) {
                Ok(committed) => {
                    let Some(domain) = collision_domain else {
                        return Ok(candidate);
                    };
                    let address = ipam_engine::add_offset(&range.network(), candidate.offset)?;
                    match self.overlap.claim(
                        &address.to_string(),
                        &pool_id.canonical_name(),
                        &request.pod_ref,
                    )? {
                        ClaimOutcome::Claimed => return Ok(candidate),
                        ClaimOutcome::HeldByOther { holder_pool } => {
                            let rollback: Vec<ReservationRecord> = records
                                .into_iter()
                                .filter(|r| r.offset != candidate.offset.to_string())
                                .collect();
                            if let Err(e) =
                                self.pool_store.update(pool_id, committed.version, rollback)
                            {
                                warn!(error = %e, pool = %pool_id.canonical_name(), "failed to roll back reservation after lost collision-domain race");
                            }
                            attempt += 1;
                            if attempt >= RetryBudget::default().max_attempts {
                                return Err(ControllerError::collision_domain_held(
                                    format!("{} ({})", address, domain),
                                    holder_pool,
                                ));
                            }
                            warn!(attempt, pool = %pool_id.canonical_name(), "lost collision-domain race, retrying");
                            tokio::time::sleep(RetryBudget::default().backoff(attempt)).await;
                            continue;
                        }
                    }
                }
                Err(ipam_engine::EngineError::Storage(ipam_storage::StorageError::Conflict {
                    ..
                })) => {
                    attempt += 1;
                    if attempt >= RetryBudget::default().max_attempts {
                        return Err(ControllerError::timeout(format!(
                            "assign_address({})",
                            pool_id.canonical_name()
                        )));
                    }
                    warn!(attempt, pool = %pool_id.canonical_name(), "CAS conflict, retrying");
                    tokio::time::sleep(RetryBudget::default().backoff(attempt)).await;
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Release every reservation matching `pod_ref`/`container_id`/
    /// `interface_name`, retrying under CAS conflict. A pool with no
    /// matching reservation is left untouched (idempotent DEL, P3).
    pub async fn release_address(
        &self,
        pool_id: &PoolId,
        range: &CidrRange,
        pod_ref: &str,
        container_id: &str,
        interface_name: &str,
    ) -> Result<Vec<u128>> {
        let mut attempt = 0;
        loop {
            let pool = self.pool_store.get_or_create(pool_id)?;
            let reserved = pool.reservations_by_offset()?;

            let freed = release(&reserved, pod_ref, container_id, interface_name);
            if freed.is_empty() {
                return Ok(freed);
            }

            let records: Vec<ReservationRecord> = reserved
                .values()
                .filter(|r| !freed.contains(&r.offset))
                .map(ReservationRecord::from)
                .collect();

            match self.pool_store.update(pool_id, pool.version, records) {
                Ok(_) => {
                    for offset in &freed {
                        if let Ok(address) = ipam_engine::add_offset(&range.network(), *offset) {
                            let _ = self.overlap.release(
                                &address.to_string(),
                                &pool_id.canonical_name(),
                                pod_ref,
                            );
                        }
                    }
                    return Ok(freed);
                }
                Err(ipam_engine::EngineError::Storage(ipam_storage::StorageError::Conflict {
                    ..
                })) => {
                    attempt += 1;
                    if attempt >= RetryBudget::default().max_attempts {
                        return Err(ControllerError::timeout(format!(
                            "release_address({})",
                            pool_id.canonical_name()
                        )));
                    }
                    tokio::time::sleep(RetryBudget::default().backoff(attempt)).await;
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Release every reservation belonging to `pod_ref`, regardless of
    /// container/interface — used by the pod cleanup controller (C7),
    /// which only knows the deleted pod's `namespace/name`.
    pub async fn release_all_for_pod(
        &self,
        pool_id: &PoolId,
        range: &CidrRange,
        pod_ref: &str,
    ) -> Result<Vec<u128>> {
        let mut attempt = 0;
        loop {
            let pool = self.pool_store.get_or_create(pool_id)?;
            let reserved = pool.reservations_by_offset()?;

            let freed = release_by_pod_ref(&reserved, pod_ref);
            if freed.is_empty() {
                return Ok(freed);
            }

            let records: Vec<ReservationRecord> = reserved
                .values()
                .filter(|r| !freed.contains(&r.offset))
                .map(ReservationRecord::from)
                .collect();

            match self.pool_store.update(pool_id, pool.version, records) {
                Ok(_) => {
                    for offset in &freed {
                        if let Ok(address) = ipam_engine::add_offset(&range.network(), *offset) {
                            let _ = self.overlap.release(
                                &address.to_string(),
                                &pool_id.canonical_name(),
                                pod_ref,
                            );
                        }
                    }
                    return Ok(freed);
                }
                Err(ipam_engine::EngineError::Storage(ipam_storage::StorageError::Conflict {
                    ..
                })) => {
                    attempt += 1;
                    if attempt >= RetryBudget::default().max_attempts {
                        return Err(ControllerError::timeout(format!(
                            "release_all_for_pod({})",
                            pool_id.canonical_name()
                        )));
                    }
                    tokio::time::sleep(RetryBudget::default().backoff(attempt)).await;
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_engine::clamp_bounds;
    use ipam_storage::RedbBackend;
    use tempfile::TempDir;

    fn orchestrator() -> (TempDir, Orchestrator<RedbBackend>) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        (dir, Orchestrator::new(backend, "kube-system"))
    }

    fn req(pod: &str) -> Request {
        Request {
            pod_ref: pod.to_string(),
            container_id: "cid-1".to_string(),
            interface_name: "eth0".to_string(),
            fixed_offset: None,
        }
    }

    #[tokio::test]
    async fn test_assign_then_idempotent_reassign_returns_same_offset() {
        let (_dir, orch) = orchestrator();
        let range = CidrRange::parse("10.10.0.0/24").unwrap();
        let bounds = clamp_bounds(&range, None, None).unwrap();
        let pool_id = PoolId::new("10.10.0.0/24");

        let first = orch
            .assign_address(
                &pool_id,
                &range,
                &bounds,
                &ExclusionSet::empty(),
                None,
                &req("default/pod-a"),
            )
            .await
            .unwrap();

        let second = orch
            .assign_address(
                &pool_id,
                &range,
                &bounds,
                &ExclusionSet::empty(),
                None,
                &req("default/pod-a"),
            )
            .await
            .unwrap();

        assert_eq!(first.offset, second.offset);
    }

    #[tokio::test]
    async fn test_assign_two_pods_get_distinct_offsets() {
        let (_dir, orch) = orchestrator();
        let range = CidrRange::parse("10.10.0.0/24").unwrap();
        let bounds = clamp_bounds(&range, None, None).unwrap();
        let pool_id = PoolId::new("10.10.0.0/24");

        let a = orch
            .assign_address(&pool_id, &range, &bounds, &ExclusionSet::empty(), None, &req("default/pod-a"))
            .await
            .unwrap();
        let b = orch
            .assign_address(&pool_id, &range, &bounds, &ExclusionSet::empty(), None, &req("default/pod-b"))
            .await
            .unwrap();

        assert_ne!(a.offset, b.offset);
    }

    #[tokio::test]
    async fn test_release_then_reassign_reuses_freed_offset() {
        let (_dir, orch) = orchestrator();
        let range = CidrRange::parse("10.10.0.0/30").unwrap();
        let bounds = clamp_bounds(&range, None, None).unwrap();
        let pool_id = PoolId::new("10.10.0.0/30");

        let a = orch
            .assign_address(&pool_id, &range, &bounds, &ExclusionSet::empty(), None, &req("default/pod-a"))
            .await
            .unwrap();

        orch.release_address(&pool_id, &range, "default/pod-a", "cid-1", "eth0")
            .await
            .unwrap();

        let b = orch
            .assign_address(&pool_id, &range, &bounds, &ExclusionSet::empty(), None, &req("default/pod-b"))
            .await
            .unwrap();

        assert_eq!(a.offset, b.offset);
    }

    #[tokio::test]
    async fn test_release_with_no_matching_reservation_is_a_no_op() {
        let (_dir, orch) = orchestrator();
        let pool_id = PoolId::new("10.10.0.0/30");
        let range = CidrRange::parse("10.10.0.0/30").unwrap();
        let freed = orch
            .release_address(&pool_id, &range, "default/ghost", "cid-x", "eth0")
            .await
            .unwrap();
        assert!(freed.is_empty());
    }

    /// S4/S5: a second pool in the same collision domain does not error out
    /// when its first candidate is already held — it scans past it and
    /// gets the next free address.
    #[tokio::test]
    async fn test_collision_domain_skips_held_address_and_assigns_next() {
        let (_dir, orch) = orchestrator();
        let range = CidrRange::parse("10.10.0.0/24").unwrap();
        let bounds = clamp_bounds(&range, None, None).unwrap();
        let pool_a = PoolId::with_network("10.10.0.0/24", "net1");
        let pool_b = PoolId::with_network("10.10.0.0/24", "net2");

        let a = orch
            .assign_address(
                &pool_a,
                &range,
                &bounds,
                &ExclusionSet::empty(),
                Some("np1"),
                &req("default/pod-a"),
            )
            .await
            .unwrap();
        assert_eq!(a.offset, 1);

        let b = orch
            .assign_address(
                &pool_b,
                &range,
                &bounds,
                &ExclusionSet::empty(),
                Some("np1"),
                &req("default/pod-b"),
            )
            .await
            .unwrap();
        assert_eq!(b.offset, 2);
    }

    /// When every address the scan can reach is already held elsewhere in
    /// the collision domain, the call fails with the pool's own exhaustion
    /// error rather than a collision-specific one.
    #[tokio::test]
    async fn test_collision_domain_exhausted_when_only_free_address_is_held() {
        let (_dir, orch) = orchestrator();
        let range = CidrRange::parse("10.10.0.0/24").unwrap();
        let bounds = clamp_bounds(&range, None, None).unwrap();
        let pool_a = PoolId::with_network("10.10.0.0/24", "net1");
        let pool_b = PoolId::with_network("10.10.0.0/24", "net2");

        orch.assign_address(
            &pool_a,
            &range,
            &bounds,
            &ExclusionSet::empty(),
            Some("np1"),
            &req("default/pod-a"),
        )
        .await
        .unwrap();

        // Exclude every address but the one pool_a already holds, so
        // pool_b's scan has nowhere else to go.
        let mut exclude_all_but_one = Vec::new();
        for i in 2u32..255 {
            exclude_all_but_one.push(CidrRange::parse(&format!("10.10.0.{}/32", i)).unwrap());
        }
        let exclusions = ExclusionSet::new(exclude_all_but_one);

        let err = orch
            .assign_address(
                &pool_b,
                &range,
                &bounds,
                &exclusions,
                Some("np1"),
                &req("default/pod-b"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Engine(ipam_engine::EngineError::Ipam(
                ipam_engine::IpamError::RangeExhausted { .. }
            ))
        ));
    }
}
