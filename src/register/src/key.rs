//! Registration key encoding.
//!
//! Keys have exactly three parts below the base path:
//! `base_path/sanitized(service_name)/address:port`.

use common::Endpoint;

const SEPARATOR: char = '/';
const PLACEHOLDER: &str = "-";

/// Replace every path separator in a service name so it stays a single key segment.
pub fn sanitize_service_name(service_name: &str) -> String {
    service_name.replace(SEPARATOR, PLACEHOLDER)
}

/// Build the store key an endpoint is published under.
pub fn registration_key(base_path: &str, service_name: &str, endpoint: &Endpoint) -> String {
    let mut key = normalize_base_path(base_path);
    if !key.is_empty() && !key.ends_with(SEPARATOR) {
        key.push(SEPARATOR);
    }
    key.push_str(&sanitize_service_name(service_name));
    key.push(SEPARATOR);
    key.push_str(&endpoint.to_string());
    key
}

/// Prefix under which every instance of a service is registered, with trailing separator.
pub fn service_prefix(base_path: &str, service_name: &str) -> String {
    let mut prefix = normalize_base_path(base_path);
    if !prefix.is_empty() && !prefix.ends_with(SEPARATOR) {
        prefix.push(SEPARATOR);
    }
    prefix.push_str(&sanitize_service_name(service_name));
    prefix.push(SEPARATOR);
    prefix
}

// Lexical cleanup of the base path: collapses repeated separators, drops `.`
// segments and a trailing separator, and resolves `..` against the previous
// segment. `..` cannot climb above the root of an absolute path. `/` stays `/`.
fn normalize_base_path(base_path: &str) -> String {
    let absolute = base_path.starts_with(SEPARATOR);
    let mut segments: Vec<&str> = Vec::new();
    for segment in base_path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if absolute => {}
                _ => segments.push(segment),
            },
            _ => segments.push(segment),
        }
    }

    let joined = segments.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(address: &str, port: u16) -> Endpoint {
        Endpoint::new(address, port)
    }

    #[test]
    fn test_registration_key() {
        let key = registration_key("/discovery", "orders", &endpoint("10.0.0.5", 18080));
        assert_eq!(key, "/discovery/orders/10.0.0.5:18080");
    }

    #[test]
    fn test_key_is_deterministic() {
        let e = endpoint("10.0.0.5", 18080).with_stage("prod");
        let first = registration_key("/discovery", "orders", &e);
        let second = registration_key("/discovery", "orders", &e.clone());
        assert_eq!(first, second);
    }

    #[test]
    fn test_distinct_instances_never_collide() {
        let instances = [
            endpoint("10.0.0.5", 18080),
            endpoint("10.0.0.5", 18081),
            endpoint("10.0.0.6", 18080),
            endpoint("10.0.0.50", 8080),
            endpoint("10.0.0.5", 8080),
        ];
        let keys: std::collections::HashSet<String> = instances
            .iter()
            .map(|e| registration_key("/discovery", "orders", e))
            .collect();
        assert_eq!(keys.len(), instances.len());
    }

    #[test]
    fn test_separators_in_service_name_are_replaced() {
        let key = registration_key("/discovery", "team/orders/v2", &endpoint("10.0.0.5", 80));
        assert_eq!(key, "/discovery/team-orders-v2/10.0.0.5:80");
    }

    #[test]
    fn test_hierarchy_depth_is_fixed() {
        let base_depth = "/discovery".split('/').count();
        for name in ["orders", "a/b", "/leading", "trailing/", "//", "a//b/c"] {
            let key = registration_key("/discovery", name, &endpoint("10.0.0.5", 80));
            assert_eq!(
                key.split('/').count(),
                base_depth + 2,
                "unexpected hierarchy for service name {name:?}: {key}"
            );
            assert!(key.ends_with("/10.0.0.5:80"));
        }
    }

    #[test]
    fn test_dot_segments_in_service_name_are_kept_literal() {
        let key = registration_key("/discovery", "..", &endpoint("10.0.0.5", 80));
        assert_eq!(key, "/discovery/../10.0.0.5:80");
    }

    #[test]
    fn test_base_path_normalization() {
        let e = endpoint("10.0.0.5", 80);
        assert_eq!(registration_key("/discovery/", "svc", &e), "/discovery/svc/10.0.0.5:80");
        assert_eq!(registration_key("//discovery//", "svc", &e), "/discovery/svc/10.0.0.5:80");
        assert_eq!(registration_key("/a/./b", "svc", &e), "/a/b/svc/10.0.0.5:80");
        assert_eq!(registration_key("/", "svc", &e), "/svc/10.0.0.5:80");
        assert_eq!(registration_key("discovery", "svc", &e), "discovery/svc/10.0.0.5:80");
    }

    #[test]
    fn test_parent_segments_in_base_path_are_resolved() {
        let e = endpoint("10.0.0.5", 80);
        assert_eq!(registration_key("/a/../b", "svc", &e), "/b/svc/10.0.0.5:80");
        assert_eq!(registration_key("/a/b/../../c/", "svc", &e), "/c/svc/10.0.0.5:80");
        assert_eq!(registration_key("/../discovery", "svc", &e), "/discovery/svc/10.0.0.5:80");
        assert_eq!(registration_key("../discovery", "svc", &e), "../discovery/svc/10.0.0.5:80");
        assert_eq!(registration_key("a/..", "svc", &e), "svc/10.0.0.5:80");
    }

    #[test]
    fn test_ipv6_endpoint_key() {
        let key = registration_key("/discovery", "orders", &endpoint("fe80::1", 443));
        assert_eq!(key, "/discovery/orders/fe80::1:443");
    }

    #[test]
    fn test_service_prefix_contains_every_key() {
        let prefix = service_prefix("/discovery/", "team/orders");
        assert_eq!(prefix, "/discovery/team-orders/");
        let key = registration_key("/discovery", "team/orders", &endpoint("10.0.0.5", 80));
        assert!(key.starts_with(&prefix));
    }
}
