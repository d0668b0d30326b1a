//! Informer cache stand-in: a broadcast channel of cluster mutation events
//! that C6 (node-slice controller) and C7 (pod cleanup controller) both
//! subscribe to, rather than each polling the cluster API independently.

use ipam_core::ResourceEvent;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Thin wrapper over a [`broadcast::Sender`]. Every watch loop that learns
/// about a cluster mutation (pod deleted, node added, pool updated) calls
/// [`EventBus::publish`]; every controller loop calls [`EventBus::subscribe`]
/// once at startup and then `select!`s on the resulting receiver.
pub struct EventBus {
    tx: broadcast::Sender<ResourceEvent>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (tx, _rx) = broadcast::channel(config.capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.tx.subscribe()
    }

    /// Ignores the "no subscribers" error: publishing with zero active
    /// controllers (e.g. during startup) is not a failure.
    pub fn publish(&self, event: ResourceEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_core::{GroupVersionKind, ResourceKey};

    fn key() -> ResourceKey {
        let gvk = GroupVersionKind::from_api_version_kind("v1", "Pod");
        ResourceKey::new(gvk, "default", "nginx")
    }

    #[tokio::test]
    async fn test_subscribe_receives_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(ResourceEvent::deleted(key(), serde_json::json!({})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.resource_key.name, "nginx");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_get_a_copy() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(ResourceEvent::added(key(), serde_json::json!({})));

        assert_eq!(rx1.recv().await.unwrap().resource_key.name, "nginx");
        assert_eq!(rx2.recv().await.unwrap().resource_key.name, "nginx");
    }

    #[test]
    fn test_publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(ResourceEvent::added(key(), serde_json::json!({})));
    }
}
