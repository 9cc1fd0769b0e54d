//! Compose manifest inspection: find the manifest in a project directory,
//! classify each service as HTTP or not, and detect its likely HTTP port.
//!
//! Classification is a fixed-order heuristic over the image name, the
//! service name, and the declared ports, with a Dockerfile `EXPOSE` scan as
//! the fallback for build-only services.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Known HTTP server images and their default ports.
const HTTP_IMAGES: &[(&str, &str)] = &[
    ("caddy", "80"),
    ("nginx", "80"),
    ("apache", "80"),
    ("httpd", "80"),
    ("node", "3000"),
    ("traefik", "80"),
];

/// Known non-HTTP images (databases, queues, caches, mail catchers).
const NON_HTTP_IMAGES: &[&str] = &[
    "postgres",
    "mysql",
    "mariadb",
    "mongo",
    "redis",
    "memcached",
    "rabbitmq",
    "elasticsearch",
    "kibana",
    "zookeeper",
    "kafka",
    "mailhog",
    "mailpit",
    "minio",
];

/// Container ports that almost always mean an HTTP server.
const KNOWN_HTTP_PORTS: &[&str] = &[
    "80", "443", "3000", "3001", "4000", "5000", "5173", "8000", "8080", "8443",
];

/// Container ports that almost never mean an HTTP server.
const KNOWN_NON_HTTP_PORTS: &[&str] = &[
    "5432", "3306", "27017", "6379", "5672", "9200", "9300", "2181", "9092", "11211",
];

/// Manifest file names Docker Compose resolves, in order.
pub const COMPOSE_FILE_NAMES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

/// One service from a compose manifest, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub image: String,
    /// Container ports observed in `ports:`, `expose:`, or the Dockerfile.
    pub ports: Vec<String>,
    pub is_http: bool,
    /// Detected HTTP port, empty when not HTTP.
    pub port: String,
}

#[derive(Debug, Deserialize)]
struct ComposeDoc {
    #[serde(default)]
    services: BTreeMap<String, ServiceDef>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceDef {
    #[serde(default)]
    image: String,
    #[serde(default)]
    build: Option<serde_yaml::Value>,
    #[serde(default)]
    ports: Vec<serde_yaml::Value>,
    #[serde(default)]
    expose: Vec<serde_yaml::Value>,
}

/// Find the compose manifest in `dir`, first match wins.
pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
    COMPOSE_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Read the compose manifest in `dir` and classify its services.
/// Services are returned sorted by name.
pub fn scan(dir: &Path) -> anyhow::Result<Vec<ServiceInfo>> {
    let compose_path = find_compose_file(dir)
        .ok_or_else(|| anyhow::anyhow!("no docker-compose.yml found in {}", dir.display()))?;

    let data = std::fs::read(&compose_path)
        .with_context(|| format!("reading {}", compose_path.display()))?;
    let doc: ComposeDoc = serde_yaml::from_slice(&data)
        .with_context(|| format!("parsing {}", compose_path.display()))?;

    let compose_dir = compose_path.parent().unwrap_or(dir);
    // BTreeMap iteration already yields services sorted by name.
    Ok(doc
        .services
        .into_iter()
        .map(|(name, def)| analyze_service(name, &def, compose_dir))
        .collect())
}

fn analyze_service(name: String, def: &ServiceDef, compose_dir: &Path) -> ServiceInfo {
    let mut ports: Vec<String> = def
        .ports
        .iter()
        .filter_map(scalar_to_string)
        .filter_map(|spec| extract_container_port(&spec))
        .collect();
    ports.extend(def.expose.iter().filter_map(scalar_to_string));

    // A build-only service declares its ports in the Dockerfile, if anywhere.
    if ports.is_empty() {
        if let Some(build) = parse_build_config(def.build.as_ref()) {
            let dockerfile = compose_dir.join(&build.context).join(&build.dockerfile);
            ports.extend(scan_dockerfile_expose(&dockerfile));
        }
    }

    let mut info = ServiceInfo {
        name,
        image: def.image.clone(),
        ports,
        is_http: false,
        port: String::new(),
    };

    let image_base = extract_image_base(&def.image);
    if NON_HTTP_IMAGES.contains(&image_base) {
        return info;
    }
    if let Some((_, port)) = HTTP_IMAGES.iter().find(|(img, _)| *img == image_base) {
        info.is_http = true;
        info.port = port.to_string();
        return info;
    }

    if NON_HTTP_IMAGES.contains(&info.name.as_str()) {
        return info;
    }

    if let Some(port) = info
        .ports
        .iter()
        .find(|p| KNOWN_HTTP_PORTS.contains(&p.as_str()))
    {
        info.port = port.clone();
        info.is_http = true;
        return info;
    }

    if def.build.is_some() {
        if let Some(port) = info
            .ports
            .iter()
            .find(|p| !KNOWN_NON_HTTP_PORTS.contains(&p.as_str()))
        {
            info.port = port.clone();
            info.is_http = true;
            return info;
        }
    }

    if let Some(port) = info
        .ports
        .iter()
        .find(|p| !KNOWN_NON_HTTP_PORTS.contains(&p.as_str()))
    {
        info.port = port.clone();
        info.is_http = true;
        return info;
    }

    info
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Container port from a mapping like `8080:80`, `127.0.0.1:8080:80`,
/// `80/tcp`, or `8000-8100`. Empty for non-numeric specs.
fn extract_container_port(spec: &str) -> Option<String> {
    let spec = spec.split('/').next().unwrap_or(spec);
    let container_part = spec.rsplit(':').next().unwrap_or(spec);
    let container_part = container_part.split('-').next().unwrap_or(container_part);
    if !container_part.is_empty() && container_part.bytes().all(|b| b.is_ascii_digit()) {
        Some(container_part.to_string())
    } else {
        None
    }
}

/// Base image name: `registry.io/org/app:v1` -> `app`.
pub fn extract_image_base(image: &str) -> &str {
    let name = image.rsplit('/').next().unwrap_or(image);
    name.split(':').next().unwrap_or(name)
}

struct BuildConfig {
    context: String,
    dockerfile: String,
}

/// The `build:` key is either a bare context path or a mapping with
/// optional `context` and `dockerfile` keys.
fn parse_build_config(raw: Option<&serde_yaml::Value>) -> Option<BuildConfig> {
    match raw? {
        serde_yaml::Value::String(context) => Some(BuildConfig {
            context: context.clone(),
            dockerfile: "Dockerfile".to_string(),
        }),
        serde_yaml::Value::Mapping(map) => {
            let get = |key: &str| {
                map.get(&serde_yaml::Value::String(key.to_string()))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            };
            Some(BuildConfig {
                context: get("context").unwrap_or_else(|| ".".to_string()),
                dockerfile: get("dockerfile").unwrap_or_else(|| "Dockerfile".to_string()),
            })
        }
        _ => None,
    }
}

/// Ports named in `EXPOSE` lines of a Dockerfile. Unreadable files yield
/// nothing; non-numeric fields are ignored.
fn scan_dockerfile_expose(path: &Path) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut ports = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if !line.to_uppercase().starts_with("EXPOSE ") {
            continue;
        }
        for field in line.split_whitespace().skip(1) {
            let port = field.split('/').next().unwrap_or(field);
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                ports.push(port.to_string());
            }
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_compose(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_extract_container_port() {
        let cases = [
            ("80", Some("80")),
            ("8080:80", Some("80")),
            ("127.0.0.1:8080:80", Some("80")),
            ("8000-8100", Some("8000")),
            ("80/tcp", Some("80")),
            ("8080:80/tcp", Some("80")),
            ("127.0.0.1:8080:80/udp", Some("80")),
            ("", None),
            ("abc", None),
        ];
        for (input, expected) in cases {
            assert_eq!(
                extract_container_port(input).as_deref(),
                expected,
                "input {input:?}"
            );
        }
    }

    #[test]
    fn test_extract_image_base() {
        assert_eq!(extract_image_base("caddy:2-alpine"), "caddy");
        assert_eq!(extract_image_base("registry.io/org/app:v1"), "app");
        assert_eq!(extract_image_base("nginx"), "nginx");
        assert_eq!(extract_image_base("library/redis:7"), "redis");
        assert_eq!(extract_image_base(""), "");
        assert_eq!(extract_image_base(":latest"), "");
    }

    #[test]
    fn test_scan_classifies_services() {
        let tmp = tempfile::tempdir().unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            r#"services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  api:
    build: .
    ports:
      - "3000:3000"
  db:
    image: postgres:16
    ports:
      - "5432:5432"
"#,
        );

        let services = scan(tmp.path()).unwrap();
        assert_eq!(services.len(), 3);
        // Sorted by name: api, db, web
        assert_eq!(services[0].name, "api");
        assert!(services[0].is_http);
        assert_eq!(services[0].port, "3000");
        assert_eq!(services[1].name, "db");
        assert!(!services[1].is_http);
        assert_eq!(services[2].name, "web");
        assert!(services[2].is_http);
        assert_eq!(services[2].port, "80");
    }

    #[test]
    fn test_scan_no_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let err = scan(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("no docker-compose.yml"));
    }

    #[test]
    fn test_scan_resolution_order_accepts_compose_yml() {
        let tmp = tempfile::tempdir().unwrap();
        write_compose(
            tmp.path(),
            "compose.yml",
            "services:\n  web:\n    image: nginx\n",
        );
        let services = scan(tmp.path()).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "web");
        assert!(services[0].is_http);
    }

    #[test]
    fn test_known_http_image_wins_without_ports() {
        let tmp = tempfile::tempdir().unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            "services:\n  proxy:\n    image: caddy:2-alpine\n",
        );
        let services = scan(tmp.path()).unwrap();
        assert!(services[0].is_http);
        assert_eq!(services[0].port, "80");
    }

    #[test]
    fn test_non_http_service_name_overrides_ports() {
        let tmp = tempfile::tempdir().unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            "services:\n  redis:\n    image: custom-image\n    ports:\n      - \"80:80\"\n",
        );
        let services = scan(tmp.path()).unwrap();
        assert!(!services[0].is_http, "service named redis must stay non-HTTP");
    }

    #[test]
    fn test_expose_directive_counts() {
        let tmp = tempfile::tempdir().unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            "services:\n  api:\n    image: myapp:latest\n    expose:\n      - \"3000\"\n",
        );
        let services = scan(tmp.path()).unwrap();
        assert!(services[0].is_http);
        assert_eq!(services[0].port, "3000");
    }

    #[test]
    fn test_numeric_port_entries() {
        let tmp = tempfile::tempdir().unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            "services:\n  api:\n    image: myapp\n    expose:\n      - 8080\n",
        );
        let services = scan(tmp.path()).unwrap();
        assert!(services[0].is_http);
        assert_eq!(services[0].port, "8080");
    }

    #[test]
    fn test_no_ports_is_not_http() {
        let tmp = tempfile::tempdir().unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            "services:\n  worker:\n    image: busybox\n",
        );
        let services = scan(tmp.path()).unwrap();
        assert!(!services[0].is_http);
    }

    #[test]
    fn test_unknown_image_with_uncommon_port_is_http() {
        let tmp = tempfile::tempdir().unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            "services:\n  svc:\n    image: custom\n    ports:\n      - \"7777:7777\"\n",
        );
        let services = scan(tmp.path()).unwrap();
        assert!(services[0].is_http);
        assert_eq!(services[0].port, "7777");
    }

    #[test]
    fn test_dockerfile_expose_scan() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("backend")).unwrap();
        std::fs::write(
            tmp.path().join("backend/Dockerfile"),
            "FROM python:3.12\nexpose 8000/tcp\nEXPOSE 9000 notaport\n",
        )
        .unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            "services:\n  backend:\n    build: ./backend\n",
        );

        let services = scan(tmp.path()).unwrap();
        assert_eq!(services[0].ports, vec!["8000", "9000"]);
        assert!(services[0].is_http);
        assert_eq!(services[0].port, "8000");
    }

    #[test]
    fn test_build_mapping_with_custom_dockerfile() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Dockerfile.dev"), "EXPOSE 5173\n").unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            "services:\n  front:\n    build:\n      context: .\n      dockerfile: Dockerfile.dev\n",
        );

        let services = scan(tmp.path()).unwrap();
        assert_eq!(services[0].ports, vec!["5173"]);
        assert!(services[0].is_http);
    }

    #[test]
    fn test_dockerfile_not_scanned_when_ports_present() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Dockerfile"), "EXPOSE 9999\n").unwrap();
        write_compose(
            tmp.path(),
            "docker-compose.yml",
            "services:\n  app:\n    build: .\n    ports:\n      - \"3000:3000\"\n",
        );
        let services = scan(tmp.path()).unwrap();
        assert_eq!(services[0].ports, vec!["3000"]);
    }

    #[test]
    fn test_malformed_manifest_errors_with_path() {
        let tmp = tempfile::tempdir().unwrap();
        write_compose(tmp.path(), "docker-compose.yml", "services: [broken: {");
        let err = scan(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("docker-compose.yml"));
    }
}
