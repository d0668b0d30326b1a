//! ipam-core - fundamental types shared by the cluster IPAM subsystem
//!
//! This crate provides the handful of Kubernetes-adjacent abstractions the
//! rest of the workspace needs: resource identity (`ResourceKey`,
//! `GroupVersionKind`), the informer-cache event shape (`ResourceEvent`),
//! and name validation. It carries no storage or allocation logic.

pub mod error;
pub mod events;
pub mod resource;
pub mod types;

pub use error::{CoreError, Result};
pub use events::{ResourceEvent, WatchEventType};
pub use resource::{is_valid_name, pod_node_name, pod_ref, NamedResource};
pub use types::{GroupVersionKind, ResourceKey};

pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Node, Pod};
