//! C2 — pure allocation engine.
//!
//! Everything here is a pure function over in-memory state: no storage, no
//! network, no clock. Idempotence (P3) and collision-domain layering (the
//! `also_reserved` parameter) are handled by the caller, which in this
//! system is `ipam_controller`'s orchestrator (C5).

use crate::cidr::{self, Addr, CidrRange};
use crate::error::{IpamError, Result};
use std::collections::{HashMap, HashSet};

/// Inclusive scan bounds, clamped into the range's usable window.
#[derive(Debug, Clone)]
pub struct Bounds {
    pub start: Addr,
    pub end: Addr,
}

/// `clamp_bounds(range, requested_start, requested_end)` — narrows an
/// operator-supplied `range_start`/`range_end` (spec.md §3) to the range's
/// usable window, rejecting anything that would leave no usable addresses.
pub fn clamp_bounds(
    range: &CidrRange,
    requested_start: Option<Addr>,
    requested_end: Option<Addr>,
) -> Result<Bounds> {
    let window_start = range.first_usable()?;
    let window_end = range.last_usable()?;

    let start = match requested_start {
        Some(s) if s > window_start => s,
        _ => window_start,
    };
    let end = match requested_end {
        Some(e) if e < window_end => e,
        _ => window_end,
    };

    if start > end {
        return Err(IpamError::invalid_config(format!(
            "range_start/range_end leave no usable addresses in {}",
            range
        )));
    }
    if !range.contains(&start) || !range.contains(&end) {
        return Err(IpamError::invalid_config(format!(
            "range_start/range_end fall outside {}",
            range
        )));
    }

    Ok(Bounds { start, end })
}

/// A statically excluded address or sub-block (spec.md's `exclude` list).
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    blocks: Vec<CidrRange>,
}

impl ExclusionSet {
    pub fn new(blocks: Vec<CidrRange>) -> Self {
        Self { blocks }
    }

    pub fn empty() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn excludes(&self, addr: &Addr) -> bool {
        self.blocks.iter().any(|b| b.contains(addr))
    }
}

/// An in-flight request to assign an address.
#[derive(Debug, Clone)]
pub struct Request {
    pub pod_ref: String,
    pub container_id: String,
    pub interface_name: String,
    /// Caller-requested fixed offset from the network address, if any
    /// (CNI_ARGS `ips=` style pinning).
    pub fixed_offset: Option<u128>,
}

/// A committed reservation: the unit C3 persists per pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub offset: u128,
    pub pod_ref: String,
    pub container_id: String,
    pub interface_name: String,
}

/// `assign(range, bounds, exclusions, reserved, also_reserved, request)`.
///
/// `reserved` is this pool's committed reservations, keyed by offset.
/// `also_reserved` is the set of offsets C5 has provisionally claimed this
/// pass against sibling pools sharing a collision domain (spec.md §4.5); an
/// offset present there is treated exactly like one already in `reserved`.
pub fn assign(
    range: &CidrRange,
    bounds: &Bounds,
    exclusions: &ExclusionSet,
    reserved: &HashMap<u128, Reservation>,
    also_reserved: &HashSet<u128>,
    request: &Request,
) -> Result<Reservation> {
    let start_offset = cidr::offset_between(&bounds.start, &range.network())?;
    let end_offset = cidr::offset_between(&bounds.end, &range.network())?;

    if let Some(fixed) = request.fixed_offset {
        if fixed < start_offset || fixed > end_offset {
            return Err(IpamError::out_of_range(fixed));
        }
        let addr = cidr::add_offset(&range.network(), fixed)?;
        if exclusions.excludes(&addr) {
            return Err(IpamError::address_in_use(fixed));
        }
        if reserved.contains_key(&fixed) || also_reserved.contains(&fixed) {
            return Err(IpamError::address_in_use(fixed));
        }
        return Ok(Reservation {
            offset: fixed,
            pod_ref: request.pod_ref.clone(),
            container_id: request.container_id.clone(),
            interface_name: request.interface_name.clone(),
        });
    }

    let mut offset = start_offset;
    loop {
        if offset > end_offset {
            return Err(IpamError::range_exhausted(range.to_cidr_string()));
        }

        let addr = cidr::add_offset(&range.network(), offset)?;
        let taken = exclusions.excludes(&addr)
            || reserved.contains_key(&offset)
            || also_reserved.contains(&offset);

        if !taken {
            return Ok(Reservation {
                offset,
                pod_ref: request.pod_ref.clone(),
                container_id: request.container_id.clone(),
                interface_name: request.interface_name.clone(),
            });
        }

        offset += 1;
    }
}

/// `release_by_pod_ref(reserved, pod_ref)` — removes every reservation
/// belonging to `pod_ref` regardless of container/interface, the matching
/// rule the pod cleanup controller (C7) uses: once a pod is gone, its
/// exact container ID is no longer observable, only its `namespace/name`.
pub fn release_by_pod_ref(reserved: &HashMap<u128, Reservation>, pod_ref: &str) -> Vec<u128> {
    reserved
        .values()
        .filter(|r| r.pod_ref == pod_ref)
        .map(|r| r.offset)
        .collect()
}

/// `release(reserved, pod_ref, container_id, interface_name)` — removes the
/// matching reservation(s), returning the offsets freed. Matching on all
/// three fields (not just `pod_ref`) lets a pod with several interfaces
/// attached to the same pool release only the interface being torn down.
pub fn release(
    reserved: &HashMap<u128, Reservation>,
    pod_ref: &str,
    container_id: &str,
    interface_name: &str,
) -> Vec<u128> {
    reserved
        .values()
        .filter(|r| {
            r.pod_ref == pod_ref
                && r.container_id == container_id
                && r.interface_name == interface_name
        })
        .map(|r| r.offset)
        .collect()
}
