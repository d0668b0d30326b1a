use crate::error::CoreError;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Validate a Kubernetes resource name (DNS-1123 subdomain).
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let chars: Vec<char> = name.chars().collect();

    if !chars[0].is_ascii_lowercase() && !chars[0].is_ascii_digit() {
        return false;
    }

    if !chars[chars.len() - 1].is_ascii_lowercase() && !chars[chars.len() - 1].is_ascii_digit() {
        return false;
    }

    chars
        .iter()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.')
}

pub fn validate_base(metadata: &ObjectMeta) -> Result<(), CoreError> {
    let name = metadata
        .name
        .as_ref()
        .ok_or_else(|| CoreError::MissingField("metadata.name".to_string()))?;

    if !is_valid_name(name) {
        return Err(CoreError::InvalidName(name.clone()));
    }

    Ok(())
}

/// Minimal trait over the two Kubernetes kinds the controllers watch. Unlike
/// the teacher's broader `Resource` trait, this crate has no generic CRUD
/// surface to serve — C6/C7 only need node name and pod identity/placement.
pub trait NamedResource {
    fn metadata(&self) -> &ObjectMeta;

    fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref()
    }
}

impl NamedResource for Pod {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

impl NamedResource for Node {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// Pull the node a pod is scheduled to, if any.
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}

/// Pull `namespace/name` for a pod, the `pod_ref` used throughout reservations.
pub fn pod_ref(pod: &Pod) -> Option<String> {
    let name = pod.metadata.name.as_ref()?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    Some(format!("{}/{}", namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("nginx"));
        assert!(is_valid_name("my-app-123"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("MyApp"));
        assert!(!is_valid_name("-myapp"));
        assert!(!is_valid_name("my_app"));
    }

    #[test]
    fn test_pod_ref() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("p1".to_string());
        pod.metadata.namespace = Some("default".to_string());
        assert_eq!(pod_ref(&pod).unwrap(), "default/p1");
    }

    #[test]
    fn test_pod_ref_default_namespace() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("p1".to_string());
        assert_eq!(pod_ref(&pod).unwrap(), "default/p1");
    }
}
