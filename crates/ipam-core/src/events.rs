use crate::types::{GroupVersionKind, ResourceKey};
use serde::{Deserialize, Serialize};

/// Watch event type, mirroring the Kubernetes watch stream vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Error,
}

/// An event broadcast on the in-process informer-cache stand-in. C6 and C7
/// each hold their own `broadcast::Receiver` and dispatch on `event_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub event_type: WatchEventType,
    pub gvk: GroupVersionKind,
    pub resource_key: ResourceKey,
    pub object: serde_json::Value,
}

impl ResourceEvent {
    pub fn added(resource_key: ResourceKey, object: serde_json::Value) -> Self {
        Self {
            event_type: WatchEventType::Added,
            gvk: resource_key.gvk.clone(),
            resource_key,
            object,
        }
    }

    pub fn modified(resource_key: ResourceKey, object: serde_json::Value) -> Self {
        Self {
            event_type: WatchEventType::Modified,
            gvk: resource_key.gvk.clone(),
            resource_key,
            object,
        }
    }

    pub fn deleted(resource_key: ResourceKey, object: serde_json::Value) -> Self {
        Self {
            event_type: WatchEventType::Deleted,
            gvk: resource_key.gvk.clone(),
            resource_key,
            object,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_event_serde_roundtrip() {
        let gvk = GroupVersionKind::from_api_version_kind("v1", "Pod");
        let key = ResourceKey::new(gvk, "default", "nginx");
        let object = serde_json::json!({"kind": "Pod"});

        let event = ResourceEvent::deleted(key, object);
        let serialized = serde_json::to_string(&event).unwrap();
        let deserialized: ResourceEvent = serde_json::from_str(&serialized).unwrap();

        assert!(matches!(deserialized.event_type, WatchEventType::Deleted));
        assert_eq!(deserialized.resource_key.name, "nginx");
    }
}
