/// Canonical object-name encoding shared by the pool store (C3) and the
/// overlap registry (C4): replace `/` and `:` with `-`, an injective mapping
/// required by the storage backend's key constraints (spec.md §3).
pub fn encode_object_name(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | ':' => '-',
            other => other,
        })
        .collect()
}

/// Prefix a storage key with the namespace hosting pool and overlap
/// objects (`WHEREABOUTS_NAMESPACE`, default `kube-system`).
pub fn namespaced_key(namespace: &str, kind: &str, name: &str) -> String {
    format!("{}/{}/{}", namespace, kind, encode_object_name(name))
}

pub fn namespaced_prefix(namespace: &str, kind: &str) -> String {
    format!("{}/{}/", namespace, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_object_name_is_injective_for_typical_inputs() {
        assert_eq!(encode_object_name("10.10.0.0/16"), "10.10.0.0-16");
        assert_eq!(encode_object_name("fd00::1"), "fd00--1");
        assert_eq!(encode_object_name("np1"), "np1");
    }

    #[test]
    fn test_namespaced_key() {
        assert_eq!(
            namespaced_key("kube-system", "pool", "10.10.0.0/16-net1"),
            "kube-system/pool/10.10.0.0-16-net1"
        );
    }
}
