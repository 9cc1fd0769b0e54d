//! HTTP-port detection from a container inspection record.
//!
//! Pure function over the inspect response: no RPCs, no filesystem. The
//! watcher calls this for every started container of an adopted project to
//! decide where the gateway should forward traffic.

use std::collections::BTreeSet;

use bollard::models::ContainerInspectResponse;

/// Known HTTP ports in priority order.
const HTTP_PORTS: &[&str] = &[
    "80", "443", "3000", "3001", "4000", "5000", "5173", "8000", "8080", "8443",
];

/// Known non-HTTP ports to skip (databases, brokers, caches). 15672 is
/// RabbitMQ management, HTTP but never the service a browser wants.
const SKIP_PORTS: &[&str] = &[
    "5432", "3306", "27017", "6379", "5672", "15672", "9200", "9300", "2181", "9092", "11211",
];

/// Compose service names that never carry the project's HTTP traffic.
const SKIP_SERVICES: &[&str] = &[
    "postgres",
    "postgresql",
    "mysql",
    "mariadb",
    "mongo",
    "mongodb",
    "redis",
    "memcached",
    "rabbitmq",
    "elasticsearch",
    "zookeeper",
    "kafka",
    "mailhog",
    "mailpit",
    "minio",
];

/// The likely HTTP port of an inspected container, or empty when none.
///
/// Exposed ports (Dockerfile `EXPOSE`) and runtime port bindings are pooled;
/// known HTTP ports win in priority order, otherwise the numerically
/// smallest port that is not a known data-service port.
pub fn detect_http_port(info: &ContainerInspectResponse) -> String {
    let service_name = info
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get("com.docker.compose.service"))
        .map(String::as_str)
        .unwrap_or("");
    if SKIP_SERVICES.contains(&service_name) {
        return String::new();
    }

    let mut ports: BTreeSet<String> = BTreeSet::new();

    if let Some(exposed) = info.config.as_ref().and_then(|c| c.exposed_ports.as_ref()) {
        for key in exposed.keys() {
            ports.insert(strip_proto(key));
        }
    }
    if let Some(bound) = info
        .network_settings
        .as_ref()
        .and_then(|ns| ns.ports.as_ref())
    {
        for key in bound.keys() {
            ports.insert(strip_proto(key));
        }
    }

    if ports.is_empty() {
        return String::new();
    }

    for p in HTTP_PORTS {
        if ports.contains(*p) {
            return p.to_string();
        }
    }

    // Numerically smallest port outside the skip list. Numeric, not
    // lexicographic: {9000, 9999} must yield 9000, {80, 443} yields 80.
    ports
        .iter()
        .filter(|p| !SKIP_PORTS.contains(&p.as_str()))
        .filter_map(|p| p.parse::<u32>().ok().map(|n| (n, p.clone())))
        .min_by_key(|(n, _)| *n)
        .map(|(_, p)| p)
        .unwrap_or_default()
}

/// `80/tcp` -> `80`.
fn strip_proto(port_key: &str) -> String {
    port_key.split('/').next().unwrap_or(port_key).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::ContainerConfig;
    use std::collections::HashMap;

    fn inspect(
        service: &str,
        exposed: &[&str],
        bound: &[&str],
    ) -> ContainerInspectResponse {
        let mut labels = HashMap::new();
        if !service.is_empty() {
            labels.insert(
                "com.docker.compose.service".to_string(),
                service.to_string(),
            );
        }

        let exposed_ports: HashMap<String, HashMap<(), ()>> = exposed
            .iter()
            .map(|p| (p.to_string(), HashMap::new()))
            .collect();
        let bound_ports: HashMap<String, Option<Vec<bollard::models::PortBinding>>> =
            bound.iter().map(|p| (p.to_string(), None)).collect();

        ContainerInspectResponse {
            config: Some(ContainerConfig {
                labels: Some(labels),
                exposed_ports: if exposed.is_empty() {
                    None
                } else {
                    Some(exposed_ports)
                },
                ..Default::default()
            }),
            network_settings: Some(bollard::models::NetworkSettings {
                ports: if bound.is_empty() {
                    None
                } else {
                    Some(bound_ports)
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_priority_over_lexicographic() {
        let info = inspect("web", &["3000/tcp", "80/tcp"], &[]);
        assert_eq!(detect_http_port(&info), "80");
    }

    #[test]
    fn test_numeric_smallest_not_lexicographic() {
        let info = inspect("svc", &["9000/tcp", "9999/tcp"], &[]);
        assert_eq!(detect_http_port(&info), "9000");
    }

    #[test]
    fn test_skip_service_name() {
        let info = inspect("postgres", &["80/tcp"], &[]);
        assert_eq!(detect_http_port(&info), "");
        let info = inspect("redis", &["6379/tcp"], &["80/tcp"]);
        assert_eq!(detect_http_port(&info), "");
    }

    #[test]
    fn test_no_ports_yields_empty() {
        let info = inspect("web", &[], &[]);
        assert_eq!(detect_http_port(&info), "");
    }

    #[test]
    fn test_skip_ports_filtered_from_fallback() {
        let info = inspect("svc", &["5432/tcp", "9100/tcp"], &[]);
        assert_eq!(detect_http_port(&info), "9100");
        // Only skip-list ports: nothing to route
        let info = inspect("svc", &["5432/tcp", "6379/tcp"], &[]);
        assert_eq!(detect_http_port(&info), "");
    }

    #[test]
    fn test_bound_ports_count() {
        let info = inspect("web", &[], &["8080/tcp"]);
        assert_eq!(detect_http_port(&info), "8080");
    }

    #[test]
    fn test_exposed_and_bound_pooled() {
        let info = inspect("web", &["9000/tcp"], &["443/tcp"]);
        assert_eq!(detect_http_port(&info), "443");
    }

    #[test]
    fn test_pure_function() {
        let info = inspect("web", &["3000/tcp", "80/tcp"], &["8080/tcp"]);
        let first = detect_http_port(&info);
        let second = detect_http_port(&info);
        assert_eq!(first, second);
    }
}
