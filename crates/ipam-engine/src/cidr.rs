//! C1 — IP arithmetic.
//!
//! All addresses are normalized to a 16-byte big-endian form so that IPv4
//! and IPv6 share one comparison and offset-arithmetic path. IPv4 addresses
//! occupy the low 4 bytes with the high 12 bytes zeroed (not the
//! `::ffff:a.b.c.d` mapped form), which is what gives every IPv4 address a
//! lower 16-byte lexicographic value than a "real" (non-zero-prefixed) IPv6
//! address, per spec.md §4.1.

use crate::error::{IpamError, Result};
use ipnetwork::IpNetwork;
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// A 16-byte normalized address. `Ord`/`PartialOrd` compare only the raw
/// bytes, which is the "lexicographic over those 16 bytes" rule from the
/// spec; family is tracked alongside for the family-mismatch checks that
/// byte comparison alone cannot express.
#[derive(Debug, Clone, Copy, Eq, Hash)]
pub struct Addr {
    bytes: [u8; 16],
    family: Family,
}

impl Addr {
    pub fn from_ipv4(addr: Ipv4Addr) -> Self {
        let mut bytes = [0u8; 16];
        bytes[12..16].copy_from_slice(&addr.octets());
        Self {
            bytes,
            family: Family::V4,
        }
    }

    pub fn from_ipv6(addr: Ipv6Addr) -> Self {
        Self {
            bytes: addr.octets(),
            family: Family::V6,
        }
    }

    pub fn from_ip_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::from_ipv4(v4),
            IpAddr::V6(v6) => Self::from_ipv6(v6),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn value(&self) -> u128 {
        u128::from_be_bytes(self.bytes)
    }

    fn from_value(value: u128, family: Family) -> Self {
        Self {
            bytes: value.to_be_bytes(),
            family,
        }
    }

    pub fn to_ip_addr(&self) -> IpAddr {
        match self.family {
            Family::V4 => IpAddr::V4(Ipv4Addr::new(
                self.bytes[12],
                self.bytes[13],
                self.bytes[14],
                self.bytes[15],
            )),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(self.bytes)),
        }
    }
}

impl PartialEq for Addr {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl PartialOrd for Addr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Addr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip_addr())
    }
}

/// `compare(a, b)` — exposed as a free function to match the spec's naming.
pub fn compare(a: &Addr, b: &Addr) -> Ordering {
    a.cmp(b)
}

fn family_bits(family: Family) -> u32 {
    match family {
        Family::V4 => 32,
        Family::V6 => 128,
    }
}

/// `add_offset(a, n)`. Fails for IPv4 when `n >= 2^32`, and on overflow past
/// the family's address space for either family.
pub fn add_offset(a: &Addr, n: u128) -> Result<Addr> {
    if a.family == Family::V4 && n >= (1u128 << 32) {
        return Err(IpamError::invalid_config(format!(
            "offset {} too large for an IPv4 address",
            n
        )));
    }

    let value = a
        .value()
        .checked_add(n)
        .ok_or_else(|| IpamError::invalid_config("offset addition overflowed address space"))?;

    if a.family == Family::V4 && value > u32::MAX as u128 {
        return Err(IpamError::invalid_config(
            "offset addition overflowed the IPv4 address space",
        ));
    }

    Ok(Addr::from_value(value, a.family))
}

pub fn inc(a: &Addr) -> Result<Addr> {
    add_offset(a, 1)
}

pub fn dec(a: &Addr) -> Result<Addr> {
    let value = a
        .value()
        .checked_sub(1)
        .ok_or_else(|| IpamError::invalid_config("address decrement underflowed"))?;
    Ok(Addr::from_value(value, a.family))
}

/// `offset_between(a, b)` = distance of `a` from base `b`. Fails if the two
/// addresses are of different families.
pub fn offset_between(a: &Addr, b: &Addr) -> Result<u128> {
    if a.family != b.family {
        return Err(IpamError::invalid_config(
            "offset_between called across address families",
        ));
    }
    a.value()
        .checked_sub(b.value())
        .ok_or_else(|| IpamError::invalid_config("offset_between: a is lower than base b"))
}

/// A parsed CIDR range (C1's `Address range` minus `start`/`end`/exclusions,
/// which live in `bounds.rs`/`exclude.rs`).
#[derive(Debug, Clone)]
pub struct CidrRange {
    pub family: Family,
    pub prefix_len: u8,
    network: Addr,
}

impl CidrRange {
    /// Parse a CIDR string, tolerating leading-zero octets (e.g.
    /// `010.010.000.000/16`), which `ipnetwork` already accepts and
    /// normalizes the way spec.md §6 requires.
    pub fn parse(cidr_str: &str) -> Result<Self> {
        let net = IpNetwork::from_str(cidr_str.trim())
            .map_err(|e| IpamError::invalid_config(format!("invalid CIDR '{}': {}", cidr_str, e)))?;

        match net {
            IpNetwork::V4(v4) => Ok(Self {
                family: Family::V4,
                prefix_len: v4.prefix(),
                network: Addr::from_ipv4(v4.network()),
            }),
            IpNetwork::V6(v6) => Ok(Self {
                family: Family::V6,
                prefix_len: v6.prefix(),
                network: Addr::from_ipv6(v6.network()),
            }),
        }
    }

    pub fn network(&self) -> Addr {
        self.network
    }

    /// Last address in the range (the IPv4 "broadcast" address; for IPv6
    /// this is the all-ones host suffix, kept for symmetry with P5's
    /// `address(k) != broadcast(range)` rule, which this system applies
    /// uniformly to both families).
    pub fn broadcast(&self) -> Result<Addr> {
        let bits = family_bits(self.family);
        let host_bits = bits - self.prefix_len as u32;
        let span = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        add_offset(&self.network, span)
    }

    /// Total addresses in the range, clamped to `u128::MAX` for a /0 IPv6
    /// range (never reachable by `usable_span` since it always subtracts 2).
    fn total_addresses(&self) -> u128 {
        let bits = family_bits(self.family);
        let host_bits = bits - self.prefix_len as u32;
        if host_bits >= 128 {
            u128::MAX
        } else {
            1u128 << host_bits
        }
    }

    /// First usable address (network + 1). Errors if the range has no
    /// usable window (`/31`, `/32` IPv4 and their IPv6 analogues).
    pub fn first_usable(&self) -> Result<Addr> {
        self.require_usable_window()?;
        inc(&self.network)
    }

    /// Last usable address (broadcast - 1).
    pub fn last_usable(&self) -> Result<Addr> {
        self.require_usable_window()?;
        dec(&self.broadcast()?)
    }

    fn require_usable_window(&self) -> Result<()> {
        if self.total_addresses() <= 2 {
            return Err(IpamError::invalid_config(format!(
                "range {}/{} has no usable addresses (network and broadcast consume the entire range)",
                self.network, self.prefix_len
            )));
        }
        Ok(())
    }

    pub fn contains(&self, addr: &Addr) -> bool {
        if addr.family != self.family {
            return false;
        }
        let Ok(last) = self.broadcast() else {
            return false;
        };
        *addr >= self.network && *addr <= last
    }

    pub fn to_cidr_string(&self) -> String {
        format!("{}/{}", self.network, self.prefix_len)
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_cidr_string())
    }
}

/// `divide(parent, child_prefix_len)` — returns `2^(child_prefix_len -
/// parent.prefix_len)` contiguous child ranges in ascending order.
pub fn divide(parent: &CidrRange, child_prefix_len: u8) -> Result<Vec<CidrRange>> {
    if child_prefix_len <= parent.prefix_len {
        return Err(IpamError::invalid_config(format!(
            "child prefix /{} must be strictly longer than parent prefix /{}",
            child_prefix_len, parent.prefix_len
        )));
    }

    let bits = family_bits(parent.family);
    if child_prefix_len as u32 > bits {
        return Err(IpamError::invalid_config(format!(
            "child prefix /{} exceeds address width for this family",
            child_prefix_len
        )));
    }

    let delta = child_prefix_len - parent.prefix_len;
    if delta as u32 >= 128 {
        return Err(IpamError::invalid_config(
            "divide: child/parent prefix delta too large to enumerate",
        ));
    }
    let count: u128 = 1u128 << delta;

    let host_bits = bits - child_prefix_len as u32;
    let block_size: u128 = if host_bits >= 128 {
        u128::MAX
    } else {
        1u128 << host_bits
    };

    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i
            .checked_mul(block_size)
            .ok_or_else(|| IpamError::invalid_config("divide: overflow computing child offset"))?;
        let network = add_offset(&parent.network, offset)?;
        out.push(CidrRange {
            family: parent.family,
            prefix_len: child_prefix_len,
            network,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr_v4() {
        let r = CidrRange::parse("10.10.0.0/16").unwrap();
        assert_eq!(r.prefix_len, 16);
        assert_eq!(r.network().to_string(), "10.10.0.0");
        assert_eq!(r.broadcast().unwrap().to_string(), "10.10.255.255");
    }

    #[test]
    fn test_parse_cidr_leading_zero_octets() {
        let r = CidrRange::parse("010.010.000.000/16").unwrap();
        assert_eq!(r.to_cidr_string(), "10.10.0.0/16");
    }

    #[test]
    fn test_usable_window_slash30() {
        let r = CidrRange::parse("10.10.0.0/30").unwrap();
        assert_eq!(r.first_usable().unwrap().to_string(), "10.10.0.1");
        assert_eq!(r.last_usable().unwrap().to_string(), "10.10.0.2");
    }

    #[test]
    fn test_usable_window_empty_for_slash31_and_slash32() {
        let r31 = CidrRange::parse("10.10.0.0/31").unwrap();
        assert!(r31.first_usable().is_err());
        let r32 = CidrRange::parse("10.10.0.0/32").unwrap();
        assert!(r32.first_usable().is_err());
    }

    #[test]
    fn test_offset_between_round_trip() {
        let r = CidrRange::parse("10.10.0.0/16").unwrap();
        let addr = CidrRange::parse("10.10.0.5/32").unwrap().network();
        let n = offset_between(&addr, &r.network()).unwrap();
        assert_eq!(n, 5);
        let back = add_offset(&r.network(), n).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_offset_between_rejects_mixed_families() {
        let v4 = CidrRange::parse("10.10.0.0/16").unwrap().network();
        let v6 = CidrRange::parse("fd00::/64").unwrap().network();
        assert!(offset_between(&v4, &v6).is_err());
    }

    #[test]
    fn test_add_offset_v4_rejects_oversized_offset() {
        let base = CidrRange::parse("10.10.0.0/16").unwrap().network();
        assert!(add_offset(&base, 1u128 << 32).is_err());
    }

    #[test]
    fn test_ipv4_sorts_before_ipv6() {
        let v4 = CidrRange::parse("255.255.255.255/32").unwrap().network();
        let v6 = CidrRange::parse("2001:db8::/64").unwrap().network();
        assert!(compare(&v4, &v6) == Ordering::Less);
    }

    #[test]
    fn test_ipv6_offset_exceeds_64_bits() {
        let r = CidrRange::parse("fd00::/64").unwrap();
        let big_offset: u128 = (1u128 << 64) + 5;
        let addr = add_offset(&r.network(), big_offset).unwrap();
        let back = offset_between(&addr, &r.network()).unwrap();
        assert_eq!(back, big_offset);
    }

    #[test]
    fn test_divide_returns_ascending_contiguous_children() {
        let parent = CidrRange::parse("10.0.0.0/8").unwrap();
        let children = divide(&parent, 20).unwrap();
        assert_eq!(children.len(), 1 << 12);
        assert_eq!(children[0].to_cidr_string(), "10.0.0.0/20");
        assert_eq!(children[1].to_cidr_string(), "10.0.16.0/20");
        assert_eq!(children.last().unwrap().to_cidr_string(), "10.255.240.0/20");
    }

    #[test]
    fn test_divide_rejects_non_strictly_longer_prefix() {
        let parent = CidrRange::parse("10.0.0.0/16").unwrap();
        assert!(divide(&parent, 16).is_err());
        assert!(divide(&parent, 8).is_err());
    }

    #[test]
    fn test_contains() {
        let r = CidrRange::parse("10.10.0.0/24").unwrap();
        assert!(r.contains(&CidrRange::parse("10.10.0.5/32").unwrap().network()));
        assert!(!r.contains(&CidrRange::parse("10.11.0.5/32").unwrap().network()));
    }
}
