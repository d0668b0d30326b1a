//! Orchestration-layer errors (spec.md §7). Pure C1/C2 failures arrive
//! wrapped from [`ipam_engine::EngineError`]; this layer adds the
//! classifications that only make sense once retries, leases and the
//! cluster API are involved.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] ipam_engine::EngineError),

    #[error("cluster API request failed: {0}")]
    #[diagnostic(code(ipam::cluster_api_error))]
    ClusterApi(#[from] reqwest::Error),

    #[error("failed to (de)serialize cluster object: {0}")]
    #[diagnostic(code(ipam::serde_error))]
    Serde(#[from] serde_json::Error),

    /// CAS lost after exhausting the retry budget (spec.md's `Conflict`).
    #[error("lost the compare-and-swap race on {resource} after exhausting the retry budget")]
    #[diagnostic(
        code(ipam::conflict),
        help("Another writer is mutating this object faster than this node can retry; consider raising retry_period")
    )]
    Conflict { resource: String },

    /// Retry budget exhausted without resolving (spec.md's `Timeout`).
    #[error("operation '{operation}' exceeded its retry budget")]
    #[diagnostic(code(ipam::timeout))]
    Timeout { operation: String },

    /// No node slice is assigned to this node yet (C6 hasn't run, or the
    /// parent pool has no capacity left to slice).
    #[error("no IP slice is assigned to node '{node}'")]
    #[diagnostic(
        code(ipam::no_slice_for_node),
        help("Check that the node-slice controller has processed this node and that the parent pool has spare capacity")
    )]
    NoSliceForNode { node: String },

    /// C4 denied the claim: another pool in the same collision domain
    /// already holds this address.
    #[error("address {address} is already claimed by pool '{holder}' in this collision domain")]
    #[diagnostic(code(ipam::collision_domain_held))]
    CollisionDomainHeld { address: String, holder: String },

    #[error("{resource} not found")]
    #[diagnostic(code(ipam::not_found))]
    NotFound { resource: String },

    /// Two attachment-definitions named the same `network_name` but disagree
    /// on `(range, slice_size)` (spec.md §4.6).
    #[error("attachment-definitions for network '{network_name}' disagree on range/slice_size")]
    #[diagnostic(
        code(ipam::node_slice_mismatch),
        help("Align the range and node_slice_size across every attachment-definition naming this network")
    )]
    NodeSliceMismatch { network_name: String },
}

pub type Result<T> = std::result::Result<T, ControllerError>;

impl From<ipam_engine::IpamError> for ControllerError {
    fn from(err: ipam_engine::IpamError) -> Self {
        ControllerError::Engine(ipam_engine::EngineError::Ipam(err))
    }
}

impl From<ipam_storage::StorageError> for ControllerError {
    fn from(err: ipam_storage::StorageError) -> Self {
        ControllerError::Engine(ipam_engine::EngineError::Storage(err))
    }
}

impl ControllerError {
    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn no_slice_for_node(node: impl Into<String>) -> Self {
        Self::NoSliceForNode { node: node.into() }
    }

    pub fn collision_domain_held(address: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::CollisionDomainHeld {
            address: address.into(),
            holder: holder.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// True when retrying the operation that produced this error, under a
    /// fresh CAS read, has a chance of succeeding (spec.md §7's retry
    /// classification: `Conflict` and `CollisionDomainHeld` are retried by
    /// C5, as are transient cluster-API errors; `NotFound`/`NoSliceForNode`
    /// are not).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::Engine(ipam_engine::EngineError::Storage(
                ipam_storage::StorageError::Conflict { .. }
            )) | ControllerError::ClusterApi(_)
                | ControllerError::CollisionDomainHeld { .. }
        )
    }
}
