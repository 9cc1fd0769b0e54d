//! The watcher: keeps the gateway configuration consistent with live
//! container state.
//!
//! A single task consumes the Docker event stream. Events are handled one
//! at a time; each event's full side-effect chain (route-table mutation,
//! Caddyfile render, atomic install, gateway reload) completes before the
//! next event is dequeued, so the gateway sees a well-defined sequence of
//! configurations. Per-event failures are logged and the loop continues;
//! only a terminal event-stream error or shutdown ends the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::network::ConnectNetworkOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::caddyfile;
use crate::detect;
use crate::docker::short_id;
use crate::gateway;
use crate::paths::Paths;
use crate::routes::{Route, RouteTable};
use crate::store::Registry;
use crate::validate;

/// How long to give a freshly started gateway before the first reload.
const GATEWAY_INIT_WAIT: Duration = Duration::from_secs(2);

/// Monitors Docker events and manages routes.
pub struct Watcher {
    docker: Docker,
    paths: Paths,
    routes: Arc<RouteTable>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Watcher {
    pub fn new(docker: Docker, paths: Paths, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            docker,
            paths,
            routes: Arc::new(RouteTable::new()),
            shutdown_rx,
        }
    }

    /// The active routes (shared for status queries).
    pub fn routes(&self) -> Arc<RouteTable> {
        Arc::clone(&self.routes)
    }

    /// Scan existing containers, then consume the event stream until
    /// shutdown or a terminal stream error.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("Starting watcher...");

        if let Err(e) = self.scan_existing().await {
            warn!(error = %e, "Failed to scan existing containers");
        }

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "stop".to_string(), "die".to_string()],
        );
        let docker = self.docker.clone();
        let mut events = docker.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        }));

        info!("Watching for container events...");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Watcher stopping.");
                        return Ok(());
                    }
                }
                event = events.next() => {
                    match event {
                        Some(Ok(msg)) => self.handle_event(msg).await,
                        Some(Err(e)) => anyhow::bail!("Docker event error: {}", e),
                        None => anyhow::bail!("Docker event stream closed"),
                    }
                }
            }
        }
    }

    async fn handle_event(&self, msg: EventMessage) {
        let Some(actor) = msg.actor else { return };
        let Some(container_id) = actor.id else { return };
        let container_name = actor
            .attributes
            .and_then(|mut a| a.remove("name"))
            .unwrap_or_default();

        // Our own gateway container also emits events; never route it.
        if container_name == gateway::CONTAINER_NAME {
            return;
        }

        match msg.action.as_deref() {
            Some("start") => {
                info!(
                    container = container_name,
                    id = short_id(&container_id),
                    "Container started"
                );
                self.handle_container_start(&container_id).await;
            }
            Some("stop") | Some("die") => {
                info!(
                    container = container_name,
                    id = short_id(&container_id),
                    "Container stopped"
                );
                self.handle_container_stop(&container_id).await;
            }
            _ => {}
        }
    }

    async fn handle_container_start(&self, container_id: &str) {
        // Projects may have been adopted since the last event.
        let registry = match Registry::load(&self.paths) {
            Ok(registry) => registry,
            Err(e) => {
                error!(error = %e, "Error loading project registry");
                return;
            }
        };

        match self.route_container(&registry, container_id).await {
            Ok(true) => {
                if let Err(e) = self.reload_routes().await {
                    error!(error = %e, "Error reloading routes");
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(id = short_id(container_id), error = %e, "Not routing container");
            }
        }
    }

    async fn handle_container_stop(&self, container_id: &str) {
        let Some(route) = self.routes.get(container_id) else {
            return; // not a routed container
        };

        info!(
            hostname = route.hostname,
            upstream = format!("{}:{}", route.container_name, route.port),
            "Route removed"
        );
        self.routes.remove(container_id);

        if let Err(e) = self.reload_routes().await {
            error!(error = %e, "Error reloading routes");
        }
    }

    /// Inspect a container and, if it belongs to an adopted project and has
    /// a detectable HTTP port, attach it to the gateway network and record
    /// its route. Returns whether a route was added.
    async fn route_container(
        &self,
        registry: &Registry,
        container_id: &str,
    ) -> anyhow::Result<bool> {
        let info = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| anyhow::anyhow!("inspecting container: {}", e))?;

        let Some(route) = resolve_route(registry, &info)? else {
            return Ok(false);
        };

        self.connect_to_network(container_id, &info).await?;

        info!(
            hostname = route.hostname,
            upstream = format!("{}:{}", route.container_name, route.port),
            "Route added"
        );
        self.routes.add(container_id, route);
        Ok(true)
    }

    /// Attach the container to the gateway network; no-op if attached.
    async fn connect_to_network(
        &self,
        container_id: &str,
        info: &ContainerInspectResponse,
    ) -> anyhow::Result<()> {
        let connected = info
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .map(|networks| networks.contains_key(gateway::NETWORK_NAME))
            .unwrap_or(false);
        if connected {
            return Ok(());
        }

        self.docker
            .connect_network(
                gateway::NETWORK_NAME,
                ConnectNetworkOptions {
                    container: container_id,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("connecting to network {}: {}", gateway::NETWORK_NAME, e))
    }

    /// Apply the start handler to every running container (skipping the
    /// gateway itself), then render once if any routes resulted.
    async fn scan_existing(&self) -> anyhow::Result<()> {
        info!("Scanning existing containers...");

        let registry = Registry::load(&self.paths).context("loading project registry")?;

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await
            .map_err(|e| anyhow::anyhow!("listing containers: {}", e))?;

        for summary in containers {
            let Some(id) = summary.id else { continue };
            let is_gateway = summary
                .names
                .as_ref()
                .map(|names| {
                    names
                        .iter()
                        .any(|n| n.trim_start_matches('/') == gateway::CONTAINER_NAME)
                })
                .unwrap_or(false);
            if is_gateway {
                continue;
            }

            if let Err(e) = self.route_container(&registry, &id).await {
                warn!(id = short_id(&id), error = %e, "Not routing container");
            }
        }

        if !self.routes.is_empty() {
            self.reload_routes().await.context("reloading routes")?;
        }

        info!(count = self.routes.len(), "Found active routes");
        Ok(())
    }

    /// Render the route snapshot, install it atomically, and have the
    /// gateway reload it, bringing the gateway up first when needed.
    async fn reload_routes(&self) -> anyhow::Result<()> {
        caddyfile::write(&self.paths, &self.routes.all()).context("writing Caddyfile")?;

        let running = gateway::is_running(&self.docker)
            .await
            .context("checking gateway")?;
        if !running {
            info!("Gateway container not running, starting it...");
            gateway::up(&self.paths).await.context("starting gateway")?;

            // Brief pause for Caddy to finish initializing in the container
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(GATEWAY_INIT_WAIT) => {}
                _ = shutdown_rx.changed() => {
                    anyhow::bail!("shutdown requested while waiting for gateway");
                }
            }
        }

        gateway::reload(&self.docker).await.context("reloading Caddy")
    }
}

/// Decide the route for an inspected container, or `None` when the
/// container should be skipped (not compose-managed, not adopted, or no
/// detectable HTTP port). Validation failures are errors so the caller can
/// log them; silent skips stay silent.
fn resolve_route(
    registry: &Registry,
    info: &ContainerInspectResponse,
) -> anyhow::Result<Option<Route>> {
    let labels = info.config.as_ref().and_then(|c| c.labels.as_ref());
    let compose_project = labels
        .and_then(|l| l.get("com.docker.compose.project"))
        .map(String::as_str)
        .unwrap_or("");
    let compose_service = labels
        .and_then(|l| l.get("com.docker.compose.service"))
        .map(String::as_str)
        .unwrap_or("");

    if compose_project.is_empty() {
        return Ok(None); // not a compose-managed container
    }

    let Some((_, project)) = registry.find_by_compose_project(compose_project) else {
        return Ok(None); // not adopted, ignore silently
    };

    let port = detect::detect_http_port(info);
    if port.is_empty() {
        info!(
            project = compose_project,
            service = compose_service,
            "No HTTP port detected, skipping (hint: add EXPOSE <port> to the \
             Dockerfile or a ports entry in docker-compose.yml)"
        );
        return Ok(None);
    }

    let hostname = project.resolve_hostname(compose_service);
    validate::hostname(&hostname)
        .with_context(|| format!("invalid hostname for {compose_project}/{compose_service}"))?;

    let container_name = info
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/'))
        .unwrap_or("");
    validate::container_name(container_name)?;

    Ok(Some(Route {
        hostname,
        container_name: container_name.to_string(),
        port,
        project: compose_project.to_string(),
        service: compose_service.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Project;
    use bollard::models::ContainerConfig;
    use std::collections::BTreeMap;

    fn registry_with(compose_project: &str) -> Registry {
        let mut registry = Registry::default();
        registry.projects.insert(
            compose_project.to_string(),
            Project {
                dir: format!("/home/dev/{compose_project}").into(),
                compose_project: compose_project.to_string(),
                hostname: format!("{compose_project}.localhost"),
                services: BTreeMap::from([(
                    "web".to_string(),
                    format!("{compose_project}.localhost"),
                )]),
            },
        );
        registry
    }

    fn inspect(name: &str, project: &str, service: &str, ports: &[&str]) -> ContainerInspectResponse {
        let mut labels = std::collections::HashMap::new();
        if !project.is_empty() {
            labels.insert("com.docker.compose.project".to_string(), project.to_string());
        }
        if !service.is_empty() {
            labels.insert("com.docker.compose.service".to_string(), service.to_string());
        }
        ContainerInspectResponse {
            name: Some(format!("/{name}")),
            config: Some(ContainerConfig {
                labels: Some(labels),
                exposed_ports: if ports.is_empty() {
                    None
                } else {
                    Some(
                        ports
                            .iter()
                            .map(|p| (p.to_string(), std::collections::HashMap::new()))
                            .collect(),
                    )
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_route_for_adopted_service() {
        let registry = registry_with("myapp");
        let info = inspect("myapp-web-1", "myapp", "web", &["80/tcp"]);

        let route = resolve_route(&registry, &info).unwrap().unwrap();
        assert_eq!(route.hostname, "myapp.localhost");
        assert_eq!(route.container_name, "myapp-web-1");
        assert_eq!(route.port, "80");
        assert_eq!(route.project, "myapp");
        assert_eq!(route.service, "web");
    }

    #[test]
    fn test_resolve_route_hostname_fallback_for_unmapped_service() {
        let registry = registry_with("myapp");
        let info = inspect("myapp-api-1", "myapp", "api", &["3000/tcp"]);

        let route = resolve_route(&registry, &info).unwrap().unwrap();
        assert_eq!(route.hostname, "api.myapp.localhost");
    }

    #[test]
    fn test_resolve_route_skips_unlabelled_container() {
        let registry = registry_with("myapp");
        let info = inspect("standalone", "", "", &["80/tcp"]);
        assert!(resolve_route(&registry, &info).unwrap().is_none());
    }

    #[test]
    fn test_resolve_route_skips_unadopted_project() {
        let registry = registry_with("myapp");
        let info = inspect("other-web-1", "other", "web", &["80/tcp"]);
        assert!(resolve_route(&registry, &info).unwrap().is_none());
    }

    #[test]
    fn test_resolve_route_skips_portless_container() {
        let registry = registry_with("myapp");
        let info = inspect("myapp-worker-1", "myapp", "worker", &[]);
        assert!(resolve_route(&registry, &info).unwrap().is_none());
    }

    #[test]
    fn test_resolve_route_skips_data_service() {
        let registry = registry_with("myapp");
        let info = inspect("myapp-db-1", "myapp", "postgres", &["5432/tcp"]);
        assert!(resolve_route(&registry, &info).unwrap().is_none());
    }

    #[test]
    fn test_resolve_route_rejects_invalid_container_name() {
        let registry = registry_with("myapp");
        let mut info = inspect("myapp-web-1", "myapp", "web", &["80/tcp"]);
        info.name = Some("/bad name".to_string());
        assert!(resolve_route(&registry, &info).is_err());
    }

    #[test]
    fn test_resolve_route_rejects_invalid_hostname() {
        let mut registry = registry_with("myapp");
        registry
            .projects
            .get_mut("myapp")
            .unwrap()
            .services
            .insert("web".to_string(), "bad{host".to_string());
        let info = inspect("myapp-web-1", "myapp", "web", &["80/tcp"]);
        assert!(resolve_route(&registry, &info).is_err());
    }
}
