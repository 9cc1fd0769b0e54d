//! The route table: which containers are currently routed, and to where.
//!
//! The watcher owns the only writer; status queries read snapshots. The
//! table is keyed by container id, so a container restart (stop + start)
//! naturally replaces its entry.

use std::collections::HashMap;

use bollard::container::ListContainersOptions;
use bollard::Docker;
use parking_lot::Mutex;

use crate::detect;
use crate::gateway;
use crate::store::Registry;

/// One binding of `hostname -> container:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub hostname: String,
    pub container_name: String,
    pub port: String,
    pub project: String,
    pub service: String,
}

/// Concurrent map from container id to its active route.
#[derive(Debug, Default)]
pub struct RouteTable {
    inner: Mutex<HashMap<String, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for a container.
    pub fn add(&self, container_id: &str, route: Route) {
        self.inner.lock().insert(container_id.to_string(), route);
    }

    /// Remove a container's route. Unknown ids are a no-op.
    pub fn remove(&self, container_id: &str) {
        self.inner.lock().remove(container_id);
    }

    pub fn get(&self, container_id: &str) -> Option<Route> {
        self.inner.lock().get(container_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot of all routes, sorted by hostname then container name so
    /// rendering the same route set always produces identical output.
    pub fn all(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.inner.lock().values().cloned().collect();
        routes.sort_by(|a, b| {
            a.hostname
                .cmp(&b.hostname)
                .then_with(|| a.container_name.cmp(&b.container_name))
        });
        routes
    }
}

/// A live route as reported by `status` / `routes`, including whether the
/// container has actually been attached to the gateway network yet.
#[derive(Debug, Clone)]
pub struct ActiveRoute {
    pub route: Route,
    pub status: &'static str,
}

/// Query running containers and report those that would be (or are) routed.
///
/// This is the CLI's view; it runs in a separate process from the watcher
/// and recomputes the pipeline from live container state.
pub async fn list_active(docker: &Docker, registry: &Registry) -> anyhow::Result<Vec<ActiveRoute>> {
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String>::default()))
        .await
        .map_err(|e| anyhow::anyhow!("listing containers: {}", e))?;

    let mut routes = Vec::new();

    for summary in containers {
        let Some(id) = summary.id else { continue };
        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        if name.is_empty() || name == gateway::CONTAINER_NAME {
            continue;
        }

        let labels = summary.labels.unwrap_or_default();
        let Some(project_label) = labels.get("com.docker.compose.project") else {
            continue;
        };
        let service = labels
            .get("com.docker.compose.service")
            .cloned()
            .unwrap_or_default();

        let Some((_, project)) = registry.find_by_compose_project(project_label) else {
            continue;
        };

        let Ok(info) = docker.inspect_container(&id, None).await else {
            continue;
        };

        let port = detect::detect_http_port(&info);
        if port.is_empty() {
            continue;
        }

        let hostname = project.resolve_hostname(&service);

        let connected = info
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .map(|networks| networks.contains_key(gateway::NETWORK_NAME))
            .unwrap_or(false);

        routes.push(ActiveRoute {
            route: Route {
                hostname,
                container_name: name,
                port,
                project: project_label.clone(),
                service,
            },
            status: if connected {
                "routed"
            } else {
                "detected (not connected)"
            },
        });
    }

    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(hostname: &str, container: &str, port: &str) -> Route {
        Route {
            hostname: hostname.to_string(),
            container_name: container.to_string(),
            port: port.to_string(),
            project: "proj".to_string(),
            service: "svc".to_string(),
        }
    }

    #[test]
    fn test_add_get_remove_len() {
        let table = RouteTable::new();
        assert_eq!(table.len(), 0);
        assert!(table.is_empty());

        table.add("c1", route("app.localhost", "web-1", "80"));
        assert_eq!(table.len(), 1);

        let got = table.get("c1").unwrap();
        assert_eq!(got.hostname, "app.localhost");
        assert!(table.get("nonexistent").is_none());

        table.remove("c1");
        assert_eq!(table.len(), 0);
        // Removing a missing id must not panic
        table.remove("nonexistent");
    }

    #[test]
    fn test_add_overwrites_same_container() {
        let table = RouteTable::new();
        table.add("c1", route("old.localhost", "web-1", "80"));
        table.add("c1", route("new.localhost", "web-1", "3000"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("c1").unwrap().hostname, "new.localhost");
    }

    #[test]
    fn test_all_sorted_by_hostname() {
        let table = RouteTable::new();
        table.add("c1", route("zebra.localhost", "zebra-1", "80"));
        table.add("c2", route("alpha.localhost", "alpha-1", "80"));
        table.add("c3", route("middle.localhost", "middle-1", "3000"));

        let all = table.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].hostname, "alpha.localhost");
        assert_eq!(all[1].hostname, "middle.localhost");
        assert_eq!(all[2].hostname, "zebra.localhost");
    }

    #[test]
    fn test_all_is_deterministic_for_shared_hostnames() {
        let a = RouteTable::new();
        a.add("c1", route("worker.localhost", "worker-1", "8000"));
        a.add("c2", route("worker.localhost", "worker-2", "8000"));

        let b = RouteTable::new();
        b.add("x9", route("worker.localhost", "worker-2", "8000"));
        b.add("x1", route("worker.localhost", "worker-1", "8000"));

        assert_eq!(a.all(), b.all());
    }

    #[test]
    fn test_snapshot_survives_later_writes() {
        let table = RouteTable::new();
        table.add("c1", route("app.localhost", "web-1", "80"));
        let snapshot = table.all();
        table.remove("c1");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].container_name, "web-1");
    }

    #[test]
    fn test_concurrent_adds_and_removes() {
        use std::sync::Arc;

        let table = Arc::new(RouteTable::new());
        let handles: Vec<_> = (0..64)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let id = format!("container-{i}");
                    table.add(&id, route("host.localhost", "container-1", "80"));
                    table.all();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 64);

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    table.remove(&format!("container-{i}"));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 0);
    }
}
