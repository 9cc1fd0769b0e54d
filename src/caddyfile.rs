//! Caddyfile rendering and atomic installation.
//!
//! The output is a pure function of the route snapshot: hostnames appear in
//! sorted order and routes sharing a hostname collapse into one site block
//! whose `reverse_proxy` directive lists every upstream, which gives Caddy
//! round-robin across replicas. Every interpolated value is validated right
//! before emission; a single bad value aborts the render and the previous
//! Caddyfile stays installed.

use std::fmt::Write as _;

use anyhow::Context;

use crate::paths::Paths;
use crate::routes::Route;
use crate::store;
use crate::validate;

/// Global options: certificates from Caddy's internal CA, and no attempt by
/// Caddy itself to install the root into the host trust store (that is the
/// `trust` command's job, with consent).
const PREAMBLE: &str = "{\n\tlocal_certs\n\tskip_install_trust\n}\n";

/// Render the Caddyfile for a route snapshot (as returned by
/// `RouteTable::all`, i.e. sorted by hostname).
pub fn render(routes: &[Route]) -> anyhow::Result<String> {
    let mut out = String::from(PREAMBLE);

    let mut i = 0;
    while i < routes.len() {
        let hostname = &routes[i].hostname;
        validate::hostname(hostname)
            .with_context(|| format!("refusing to render route for {:?}", hostname))?;

        let mut upstreams = String::new();
        let mut j = i;
        while j < routes.len() && routes[j].hostname == *hostname {
            let route = &routes[j];
            validate::container_name(&route.container_name).with_context(|| {
                format!("refusing to render upstream for {:?}", hostname)
            })?;
            validate::port(&route.port)
                .with_context(|| format!("refusing to render upstream for {:?}", hostname))?;
            if !upstreams.is_empty() {
                upstreams.push(' ');
            }
            write!(upstreams, "{}:{}", route.container_name, route.port).expect("write to string");
            j += 1;
        }

        write!(
            out,
            "\n{} {{\n\ttls internal\n\treverse_proxy {}\n}}\n",
            hostname, upstreams
        )
        .expect("write to string");
        i = j;
    }

    Ok(out)
}

/// Render and atomically install the Caddyfile for a route snapshot.
pub fn write(paths: &Paths, routes: &[Route]) -> anyhow::Result<()> {
    let content = render(routes)?;
    install(paths, &content)
}

/// Install pre-rendered content: temp file in the caddyfile directory, then
/// rename over the live file so the gateway's reload never sees a torn read.
pub fn install(paths: &Paths, content: &str) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    store::atomic_write(&paths.caddyfile_path(), content.as_bytes())
        .context("installing Caddyfile")
}
