//! ipam-engine - CIDR arithmetic, the pure allocation engine, and the
//! versioned pool/overlap stores built on top of `ipam-storage`.
//!
//! Maps to spec.md's C1 (`cidr`), C2 (`allocate`), C3 (`pool_store`) and
//! C4 (`overlap`). Orchestration, retries and cluster-object wiring (C5-C8)
//! live one crate up, in `ipam-controller`.

pub mod allocate;
pub mod cidr;
pub mod error;
pub mod naming;
pub mod overlap;
pub mod pool_store;

pub use allocate::{
    assign, clamp_bounds, release, release_by_pod_ref, Bounds, ExclusionSet, Reservation, Request,
};
pub use cidr::{add_offset, compare, dec, divide, inc, offset_between, Addr, CidrRange, Family};
pub use error::{EngineError, EngineResult, IpamError, Result};
pub use naming::PoolId;
pub use overlap::{ClaimOutcome, OverlapEntry, OverlapRegistry, ReleaseOutcome};
pub use pool_store::{PoolRecord, PoolStore, ReservationRecord};
