//! Canonical naming for pool and overlap objects (spec.md §3).

use ipam_storage::encode_object_name;

/// Identifies a pool by the composite key spec.md §3 defines: `(range,
/// network_name, node_name?)`. `network_name` is the collision-domain label
/// that keeps two attachment-definitions on the same CIDR from sharing a
/// pool; `node_name` is set only when node-slicing resolved this pool to a
/// particular node's slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub range: String,
    pub network_name: Option<String>,
    pub node_name: Option<String>,
}

impl PoolId {
    pub fn new(range: impl Into<String>) -> Self {
        Self {
            range: range.into(),
            network_name: None,
            node_name: None,
        }
    }

    pub fn with_network(range: impl Into<String>, network_name: impl Into<String>) -> Self {
        Self {
            range: range.into(),
            network_name: Some(network_name.into()),
            node_name: None,
        }
    }

    pub fn with_network_and_node(
        range: impl Into<String>,
        network_name: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            range: range.into(),
            network_name: Some(network_name.into()),
            node_name: Some(node_name.into()),
        }
    }

    /// The object name used as the pool's storage key, after `/` and `:`
    /// have been replaced with `-`.
    pub fn canonical_name(&self) -> String {
        let mut raw = self.range.clone();
        if let Some(network_name) = &self.network_name {
            raw = format!("{}-{}", raw, network_name);
        }
        if let Some(node_name) = &self.node_name {
            raw = format!("{}-{}", raw, node_name);
        }
        encode_object_name(&raw)
    }
}
