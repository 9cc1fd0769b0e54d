//! Docker daemon connection handling.
//!
//! Connection priority: the `DOCKER_HOST` environment variable, then the
//! common per-platform socket locations, then bollard's built-in default.
//! Every returned client has answered a ping, so callers can treat
//! connection errors and daemon-down errors uniformly.

use bollard::Docker;
use tracing::debug;

/// Connect to the Docker daemon and verify it responds.
pub async fn connect() -> anyhow::Result<Docker> {
    let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
        connect_to_host(&host).map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                 Ensure Docker is running and accessible.",
                host,
                e
            )
        })?
    } else {
        return connect_with_defaults().await;
    };

    client.ping().await.map_err(|e| {
        anyhow::anyhow!(
            "Docker daemon is not responding: {}. \
             Ensure Docker Desktop, Colima, or dockerd is running.",
            e
        )
    })?;

    debug!("Connected to Docker daemon");
    Ok(client)
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid DOCKER_HOST format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

async fn connect_with_defaults() -> anyhow::Result<Docker> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths: Vec<(&str, String)> = vec![
        ("Linux default", "/var/run/docker.sock".to_string()),
        ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
        ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
        ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    let mut tried_paths = Vec::new();

    for (name, path) in &socket_paths {
        if path.is_empty() || path.contains("//") {
            continue; // Skip invalid paths from empty env vars
        }

        if std::path::Path::new(path).exists() {
            debug!(path, name, "Found Docker socket");
            match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                Ok(client) => {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                    tried_paths.push(format!(
                        "{} ({}) - socket exists but daemon not responding",
                        path, name
                    ));
                }
                Err(e) => {
                    tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                }
            }
        }
    }

    match Docker::connect_with_socket_defaults() {
        Ok(client) => Ok(client),
        Err(e) => {
            let tried_info = if tried_paths.is_empty() {
                "No Docker socket found at common locations".to_string()
            } else {
                format!("Tried:\n  - {}", tried_paths.join("\n  - "))
            };

            anyhow::bail!(
                "Cannot connect to Docker daemon. {}\n\n\
                 To fix this:\n\
                 - Start Docker Desktop, Colima, or dockerd\n\
                 - Or set DOCKER_HOST environment variable\n\n\
                 Underlying error: {}",
                tried_info,
                e
            )
        }
    }
}

/// First twelve characters of a container id, for log lines.
pub fn short_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}
