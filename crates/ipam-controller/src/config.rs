//! CNI network configuration parsing (spec.md §6): the `ipam` stanza of a
//! CNI `NetConf`, plus the `range`/`ipRanges` merge rule from Open Question
//! #1 (see DESIGN.md): a legacy single `range` is prepended to `ipRanges`.

use ipam_engine::{Addr, CidrRange};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

fn default_retry_cap() -> u32 {
    2
}

fn default_namespace() -> String {
    "kube-system".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeConfig {
    pub range: String,
    #[serde(default)]
    pub range_start: Option<IpAddr>,
    #[serde(default)]
    pub range_end: Option<IpAddr>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub kubeconfig: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(rename = "type", default)]
    pub plugin_type: Option<String>,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub range_start: Option<IpAddr>,
    #[serde(default)]
    pub range_end: Option<IpAddr>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default, rename = "ipRanges")]
    pub ip_ranges: Vec<RangeConfig>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub network_name: Option<String>,
    #[serde(default = "default_true")]
    pub enable_overlapping_ranges: bool,
    #[serde(default)]
    pub node_slice_size: Option<String>,
    #[serde(default)]
    pub configuration_path: Option<String>,
    #[serde(default)]
    pub kubernetes: Option<KubernetesConfig>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,
    #[serde(default = "default_lease_duration_ms")]
    pub leader_lease_duration_ms: u64,
    #[serde(default = "default_renew_deadline_ms")]
    pub leader_renew_deadline_ms: u64,
    #[serde(default = "default_retry_period_ms")]
    pub leader_retry_period_ms: u64,
}

fn default_lease_duration_ms() -> u64 {
    1500
}
fn default_renew_deadline_ms() -> u64 {
    1000
}
fn default_retry_period_ms() -> u64 {
    500
}

/// A fully resolved range after `range`/`ipRanges` merge and CIDR parsing.
pub struct ResolvedRange {
    pub cidr: CidrRange,
    pub range_start: Option<Addr>,
    pub range_end: Option<Addr>,
    pub exclude: Vec<String>,
}

impl NetConf {
    /// The effective list of ranges this attachment allocates from: a
    /// top-level `range`, if present, prepended to `ipRanges` — this is
    /// Open Question #1's resolution, so that legacy single-range configs
    /// keep working unchanged while multi-range configs lose nothing.
    pub fn ranges(&self) -> Vec<RangeConfig> {
        let mut out = Vec::with_capacity(self.ip_ranges.len() + 1);
        if let Some(range) = &self.range {
            out.push(RangeConfig {
                range: range.clone(),
                range_start: self.range_start,
                range_end: self.range_end,
                exclude: self.exclude.clone(),
            });
        }
        out.extend(self.ip_ranges.iter().cloned());
        out
    }

    /// `node_slice_size` as a prefix length, e.g. `"/28"` -> `28`.
    pub fn node_slice_size_prefix(&self) -> Option<u8> {
        self.node_slice_size
            .as_deref()
            .and_then(|s| s.trim_start_matches('/').parse::<u8>().ok())
    }

    pub fn retry_budget(&self) -> crate::orchestrator::RetryBudget {
        crate::orchestrator::RetryBudget {
            lease_duration: Duration::from_millis(self.leader_lease_duration_ms),
            renew_deadline: Duration::from_millis(self.leader_renew_deadline_ms),
            retry_period: Duration::from_millis(self.leader_retry_period_ms),
            max_attempts: self.retry_cap,
        }
    }
}

impl RangeConfig {
    pub fn resolve(&self) -> ipam_engine::Result<ResolvedRange> {
        let cidr = CidrRange::parse(&self.range)?;
        Ok(ResolvedRange {
            range_start: self.range_start.map(Addr::from_ip_addr),
            range_end: self.range_end.map(Addr::from_ip_addr),
            cidr,
            exclude: self.exclude.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_prepends_legacy_range_before_ip_ranges() {
        let conf = NetConf {
            plugin_type: None,
            range: Some("10.10.0.0/16".to_string()),
            range_start: None,
            range_end: None,
            exclude: vec![],
            ip_ranges: vec![RangeConfig {
                range: "fd00::/64".to_string(),
                range_start: None,
                range_end: None,
                exclude: vec![],
            }],
            gateway: None,
            interface: None,
            network_name: None,
            enable_overlapping_ranges: true,
            node_slice_size: None,
            configuration_path: None,
            kubernetes: None,
            namespace: default_namespace(),
            retry_cap: default_retry_cap(),
            leader_lease_duration_ms: default_lease_duration_ms(),
            leader_renew_deadline_ms: default_renew_deadline_ms(),
            leader_retry_period_ms: default_retry_period_ms(),
        };
        let ranges = conf.ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].range, "10.10.0.0/16");
        assert_eq!(ranges[1].range, "fd00::/64");
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let json = r#"{"range": "10.10.0.0/16"}"#;
        let conf: NetConf = serde_json::from_str(json).unwrap();
        assert_eq!(conf.namespace, "kube-system");
        assert_eq!(conf.retry_cap, 2);
        assert_eq!(conf.leader_lease_duration_ms, 1500);
    }

    #[test]
    fn test_deserialize_with_ip_ranges() {
        let json = r#"{"ipRanges": [{"range": "10.10.0.0/24"}, {"range": "10.20.0.0/24"}]}"#;
        let conf: NetConf = serde_json::from_str(json).unwrap();
        assert_eq!(conf.ranges().len(), 2);
    }
}
