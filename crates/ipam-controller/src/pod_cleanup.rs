//! C7 — pod cleanup controller: releases every address a deleted pod held,
//! across every non-default network interface it was attached to (spec.md
//! §4.7). Runs on every node, scoped to pods that were scheduled there.

use crate::config::NetConf;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::node_slice::NodeSliceStore;
use crate::orchestrator::Orchestrator;
use ipam_core::k8s_openapi::api::core::v1::Pod;
use ipam_core::{GroupVersionKind, ResourceEvent, ResourceKey, WatchEventType};
use ipam_engine::PoolId;
use ipam_storage::KVStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{error, info, warn};

pub(crate) const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/network-status";
const DEFAULT_RETRY_CAP: u32 = 2;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NetworkStatusEntry {
    #[allow(dead_code)]
    pub interface: Option<String>,
    pub name: String,
    #[serde(default)]
    pub default: bool,
    /// Addresses (with or without a prefix length) this attachment is
    /// currently carrying, as reported by the CNI network-status annotation.
    #[serde(default)]
    pub ips: Vec<String>,
}

/// Parse a pod's `k8s.v1.cni.cncf.io/network-status` annotation, if present.
pub(crate) fn network_status_entries(pod: &Pod) -> Option<Vec<NetworkStatusEntry>> {
    let annotations = pod.metadata.annotations.as_ref()?;
    let raw = annotations.get(NETWORK_STATUS_ANNOTATION)?;
    match serde_json::from_str::<Vec<NetworkStatusEntry>>(raw) {
        Ok(entries) => Some(entries),
        Err(e) => {
            warn!(error = %e, "malformed network-status annotation");
            None
        }
    }
}

/// Resolves a network name (an attachment-definition's `network_name`) to
/// its IPAM configuration, reading the defaults mounted on disk per
/// spec.md §6. Implemented by `ipam-cli`'s on-disk loader; a trait here so
/// the controller stays testable without a filesystem.
pub trait NetworkConfigResolver: Send + Sync {
    fn resolve(&self, network_name: &str) -> Option<NetConf>;
}

pub struct PodCleanupController<S: KVStore> {
    orchestrator: Arc<Orchestrator<S>>,
    node_slices: NodeSliceStore<S>,
    resolver: Arc<dyn NetworkConfigResolver>,
    event_bus: Arc<EventBus>,
    node_name: String,
    retry_counts: Mutex<HashMap<String, u32>>,
}

impl<S: KVStore> PodCleanupController<S> {
    pub fn new(
        store: Arc<S>,
        namespace: impl Into<String>,
        orchestrator: Arc<Orchestrator<S>>,
        resolver: Arc<dyn NetworkConfigResolver>,
        event_bus: Arc<EventBus>,
        node_name: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            orchestrator,
            node_slices: NodeSliceStore::new(store, namespace),
            resolver,
            event_bus,
            node_name: node_name.into(),
            retry_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a single deletion event. Ignored if the pod wasn't scheduled
    /// to this node, or carries no CNI network-status annotation.
    pub async fn handle_pod_deleted(&self, pod: &Pod) -> Result<()> {
        let Some(scheduled_node) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
            return Ok(());
        };
        if scheduled_node != self.node_name {
            return Ok(());
        }

        let pod_ref = ipam_core::pod_ref(pod).unwrap_or_default();
        let Some(entries) = network_status_entries(pod) else {
            return Ok(());
        };

        let mut last_err = None;
        for entry in entries.iter().filter(|e| !e.default) {
            let Some(conf) = self.resolver.resolve(&entry.name) else {
                warn!(network = %entry.name, "ignoring non-ipamd attachment-definition during cleanup");
                continue;
            };

            for range_conf in conf.ranges() {
                let Ok(resolved) = range_conf.resolve() else {
                    continue;
                };

                // Mirror the CNI plugin's effective-pool resolution (spec.md
                // §4.6): when this network is node-sliced the pool actually
                // holding the reservation is keyed by the node's slice, not
                // the parent range.
                let (pool_id, effective_range) =
                    match (&conf.network_name, conf.node_slice_size_prefix()) {
                        (Some(network_name), Some(_)) => {
                            match self.node_slices.slice_for_node(network_name, &self.node_name) {
                                Ok(Some(slice)) => (
                                    PoolId::with_network_and_node(
                                        slice.to_cidr_string(),
                                        network_name.clone(),
                                        self.node_name.clone(),
                                    ),
                                    slice,
                                ),
                                Ok(None) => continue,
                                Err(e) => {
                                    error!(network = %network_name, error = %e, "failed to resolve node slice during cleanup");
                                    last_err = Some(e);
                                    continue;
                                }
                            }
                        }
                        (Some(network_name), None) => (
                            PoolId::with_network(resolved.cidr.to_cidr_string(), network_name.clone()),
                            resolved.cidr.clone(),
                        ),
                        (None, _) => (
                            PoolId::new(resolved.cidr.to_cidr_string()),
                            resolved.cidr.clone(),
                        ),
                    };

                match self
                    .orchestrator
                    .release_all_for_pod(&pool_id, &effective_range, &pod_ref)
                    .await
                {
                    Ok(freed) => {
                        for offset in freed {
                            self.event_bus.publish(garbage_collected_event(&pod_ref, offset));
                        }
                    }
                    Err(e) => {
                        error!(error = %e, pool = %pool_id.canonical_name(), "failed releasing pod's reservation");
                        last_err = Some(e);
                    }
                }
            }
        }

        match last_err {
            None => {
                self.retry_counts.lock().unwrap().remove(&pod_ref);
                Ok(())
            }
            Some(e) => {
                let mut counts = self.retry_counts.lock().unwrap();
                let count = counts.entry(pod_ref.clone()).or_insert(0);
                *count += 1;
                if *count > DEFAULT_RETRY_CAP {
                    counts.remove(&pod_ref);
                    self.event_bus
                        .publish(garbage_collection_failed_event(&pod_ref));
                    warn!(pod_ref = %pod_ref, "garbage collection retry cap exceeded, dropping");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Main loop: drain deletion events from the event bus until the
    /// channel closes or cancellation fires. Matches the `tokio::select!`
    /// shape used by C6.
    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) {
        let mut rx = self.event_bus.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pod cleanup controller shutting down");
                    return;
                }
                event = rx.recv() => {
                    match event {
                        Ok(ev) if matches!(ev.event_type, WatchEventType::Deleted) && ev.gvk.kind == "Pod" => {
                            if let Ok(pod) = serde_json::from_value::<Pod>(ev.object) {
                                if let Err(e) = self.handle_pod_deleted(&pod).await {
                                    error!(error = %e, "pod cleanup failed, will rely on next delivery or reconcile pass");
                                }
                            }
                        }
                        Ok(_) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "pod cleanup controller lagged, some deletions may have been missed until the next batch reconcile");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            info!("event bus closed, stopping pod cleanup controller");
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn garbage_collected_event(pod_ref: &str, offset: u128) -> ResourceEvent {
    let gvk = GroupVersionKind::from_api_version_kind("v1", "Event");
    let key = ResourceKey::new(gvk, "kube-system", format!("gc-{}-{}", pod_ref.replace('/', "-"), offset));
    ResourceEvent::added(
        key,
        serde_json::json!({"reason": "GarbageCollected", "podRef": pod_ref, "offset": offset.to_string()}),
    )
}

fn garbage_collection_failed_event(pod_ref: &str) -> ResourceEvent {
    let gvk = GroupVersionKind::from_api_version_kind("v1", "Event");
    let key = ResourceKey::new(gvk, "kube-system", format!("gc-failed-{}", pod_ref.replace('/', "-")));
    ResourceEvent::added(
        key,
        serde_json::json!({"reason": "GarbageCollectionFailed", "podRef": pod_ref}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_core::k8s_openapi::api::core::v1::{Pod, PodSpec};
    use ipam_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use ipam_engine::{CidrRange, Request};
    use ipam_storage::RedbBackend;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct StaticResolver(HashMap<String, NetConf>);
    impl NetworkConfigResolver for StaticResolver {
        fn resolve(&self, network_name: &str) -> Option<NetConf> {
            self.0.get(network_name).cloned()
        }
    }

    fn make_pod(name: &str, node: &str, network_status: &str) -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(NETWORK_STATUS_ANNOTATION.to_string(), network_status.to_string());
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn setup() -> (TempDir, Arc<RedbBackend>, Arc<Orchestrator<RedbBackend>>, Arc<EventBus>) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        let orch = Arc::new(Orchestrator::new(backend.clone(), "kube-system"));
        let bus = Arc::new(EventBus::default());
        (dir, backend, orch, bus)
    }

    #[tokio::test]
    async fn test_handle_pod_deleted_releases_reservation_and_emits_event() {
        let (_dir, backend, orch, bus) = setup();
        let range = CidrRange::parse("10.10.0.0/24").unwrap();
        let bounds = ipam_engine::clamp_bounds(&range, None, None).unwrap();
        let pool_id = PoolId::new("10.10.0.0/24");
        orch.assign_address(
            &pool_id,
            &range,
            &bounds,
            &ipam_engine::ExclusionSet::empty(),
            None,
            &Request {
                pod_ref: "default/pod-a".to_string(),
                container_id: String::new(),
                interface_name: String::new(),
                fixed_offset: None,
            },
        )
        .await
        .unwrap();

        let mut confs = HashMap::new();
        confs.insert(
            "net1".to_string(),
            serde_json::from_value::<NetConf>(serde_json::json!({"range": "10.10.0.0/24"})).unwrap(),
        );
        let resolver = Arc::new(StaticResolver(confs));
        let controller = PodCleanupController::new(
            backend,
            "kube-system",
            orch.clone(),
            resolver,
            bus.clone(),
            "node-a",
        );

        let mut rx = bus.subscribe();
        let pod = make_pod(
            "pod-a",
            "node-a",
            r#"[{"interface":"eth0","name":"net1","default":false}]"#,
        );
        controller.handle_pod_deleted(&pod).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.object["reason"], "GarbageCollected");
    }

    #[tokio::test]
    async fn test_handle_pod_deleted_ignores_pod_on_other_node() {
        let (_dir, backend, orch, bus) = setup();
        let resolver = Arc::new(StaticResolver(HashMap::new()));
        let controller = PodCleanupController::new(backend, "kube-system", orch, resolver, bus, "node-a");
        let pod = make_pod("pod-a", "node-b", "[]");
        controller.handle_pod_deleted(&pod).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_pod_deleted_ignores_unrecognized_network() {
        let (_dir, backend, orch, bus) = setup();
        let resolver = Arc::new(StaticResolver(HashMap::new()));
        let controller = PodCleanupController::new(backend, "kube-system", orch, resolver, bus, "node-a");
        let pod = make_pod(
            "pod-a",
            "node-a",
            r#"[{"interface":"eth0","name":"other-cni","default":false}]"#,
        );
        controller.handle_pod_deleted(&pod).await.unwrap();
    }
}
