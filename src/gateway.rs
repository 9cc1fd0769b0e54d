//! Gateway (Caddy) container lifecycle and trust management.
//!
//! The gateway container, its network, and its volumes are defined by a
//! compose manifest embedded in the binary and materialized under
//! `~/.caddy-atc/`. `up`/`down` drive `docker compose` against that
//! manifest; inspection, restart, the in-container config reload, and CA
//! extraction talk to the Docker API directly.

use std::io::Read;
use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use bollard::container::{DownloadFromContainerOptions, RestartContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::caddyfile;
use crate::paths::Paths;
use crate::store;

/// Name of the gateway container.
pub const CONTAINER_NAME: &str = "caddy-atc";

/// Name of the shared network joining the gateway with routed containers.
pub const NETWORK_NAME: &str = "caddy-atc";

/// Compose manifest that defines the gateway stack.
const GATEWAY_COMPOSE: &str = include_str!("../assets/gateway-compose.yml");

/// Where Caddy keeps its internal root CA inside the container.
const CA_CERT_PATH: &str = "/data/caddy/pki/authorities/local/root.crt";

/// Upper bound on the extracted certificate; far more than any CA cert.
const MAX_CERT_SIZE: u64 = 1 << 20;

/// Ensure the gateway container exists and is running. Idempotent.
pub async fn up(paths: &Paths) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    store::atomic_write(&paths.gateway_compose_path(), GATEWAY_COMPOSE.as_bytes())
        .context("writing gateway compose manifest")?;

    // Caddy refuses to start without a config; install the empty one first.
    if !paths.caddyfile_path().exists() {
        caddyfile::write(paths, &[])?;
    }

    run_compose(paths, &["up", "-d"]).await
}

/// Stop and remove the gateway container.
pub async fn down(paths: &Paths) -> anyhow::Result<()> {
    if !paths.gateway_compose_path().exists() {
        store::atomic_write(&paths.gateway_compose_path(), GATEWAY_COMPOSE.as_bytes())
            .context("writing gateway compose manifest")?;
    }
    run_compose(paths, &["down"]).await
}

/// Restart the gateway container in place. This recovers the
/// running-but-unresponsive state Docker Desktop leaves behind after host
/// sleep.
pub async fn restart(docker: &Docker) -> anyhow::Result<()> {
    docker
        .restart_container(CONTAINER_NAME, Some(RestartContainerOptions { t: 5 }))
        .await
        .map_err(|e| anyhow::anyhow!("restarting gateway container: {}", e))?;
    info!("Gateway container restarted");
    Ok(())
}

/// Whether the gateway container currently reports running.
pub async fn is_running(docker: &Docker) -> anyhow::Result<bool> {
    match docker.inspect_container(CONTAINER_NAME, None).await {
        Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("inspecting gateway container: {}", e)),
    }
}

/// Ask the running Caddy to reload its configuration.
pub async fn reload(docker: &Docker) -> anyhow::Result<()> {
    let exec = docker
        .create_exec(
            CONTAINER_NAME,
            CreateExecOptions::<String> {
                cmd: Some(
                    ["caddy", "reload", "--config", "/etc/caddy/Caddyfile"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("creating reload exec: {}", e))?;

    let mut captured = String::new();
    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| anyhow::anyhow!("starting reload exec: {}", e))?
    {
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(log) => captured.push_str(&log.to_string()),
                Err(e) => {
                    warn!(error = %e, "Error reading reload output");
                    break;
                }
            }
        }
    }

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .map_err(|e| anyhow::anyhow!("inspecting reload exec: {}", e))?;
    match inspect.exit_code {
        Some(0) | None => {
            debug!("Caddy configuration reloaded");
            Ok(())
        }
        Some(code) => anyhow::bail!(
            "caddy reload exited with status {}: {}",
            code,
            captured.trim()
        ),
    }
}

/// Extract Caddy's root CA and install it in the system trust store.
pub async fn trust(paths: &Paths, docker: &Docker) -> anyhow::Result<()> {
    if !is_running(docker).await? {
        anyhow::bail!("caddy gateway is not running - run 'caddy-atc up' first");
    }

    let mut stream = docker.download_from_container(
        CONTAINER_NAME,
        Some(DownloadFromContainerOptions { path: CA_CERT_PATH }),
    );
    let mut archive = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            anyhow::anyhow!(
                "extracting CA cert: {}\nThe CA cert may not exist yet. \
                 Try visiting https://localhost first to trigger cert generation",
                e
            )
        })?;
        archive.extend_from_slice(&chunk);
    }

    let cert = extract_from_tar(&archive[..], MAX_CERT_SIZE)
        .context("reading CA cert from archive")?;

    let cert_path = paths.ca_cert_path();
    std::fs::write(&cert_path, &cert)
        .with_context(|| format!("saving CA cert to {}", cert_path.display()))?;
    println!("CA certificate saved to: {}", cert_path.display());

    install_cert(&cert_path)
}

/// Read the first regular file from a tar archive, enforcing a size cap.
fn extract_from_tar(reader: impl Read, max_bytes: u64) -> anyhow::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().context("reading archive")? {
        let mut entry = entry.context("reading archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut buf = Vec::new();
        entry
            .by_ref()
            .take(max_bytes + 1)
            .read_to_end(&mut buf)
            .context("reading archive entry contents")?;
        if buf.len() as u64 > max_bytes {
            anyhow::bail!("certificate file too large (>{} bytes)", max_bytes);
        }
        return Ok(buf);
    }
    anyhow::bail!("certificate not found in archive")
}

fn install_cert(cert_path: &Path) -> anyhow::Result<()> {
    if cfg!(target_os = "linux") {
        if is_wsl() {
            install_cert_wsl(cert_path)
        } else {
            install_cert_linux(cert_path)
        }
    } else if cfg!(target_os = "macos") {
        install_cert_macos(cert_path)
    } else {
        println!("\nManually install the CA certificate:\n  {}", cert_path.display());
        Ok(())
    }
}

fn install_cert_linux(cert_path: &Path) -> anyhow::Result<()> {
    let dest = "/usr/local/share/ca-certificates/caddy-atc-root-ca.crt";

    let status = std::process::Command::new("sudo")
        .args(["cp", &cert_path.to_string_lossy(), dest])
        .status()
        .context("running sudo cp")?;
    if !status.success() {
        anyhow::bail!("copying cert to system store failed (try running with sudo)");
    }

    let status = std::process::Command::new("sudo")
        .arg("update-ca-certificates")
        .status()
        .context("running update-ca-certificates")?;
    if !status.success() {
        anyhow::bail!("update-ca-certificates failed");
    }

    println!("CA certificate installed in system trust store.");
    Ok(())
}

fn install_cert_macos(cert_path: &Path) -> anyhow::Result<()> {
    println!();
    println!("Install the CA certificate into the macOS keychain:");
    println!();
    println!(
        "  sudo security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain {}",
        cert_path.display()
    );
    println!();
    println!("Restart your browser afterwards for the change to take effect.");
    Ok(())
}

fn install_cert_wsl(cert_path: &Path) -> anyhow::Result<()> {
    if let Err(e) = install_cert_linux(cert_path) {
        println!("Warning: Linux trust store install failed: {e}");
    }

    let user = detect_windows_user().unwrap_or_else(|| "<your-windows-username>".to_string());
    let win_cert_path = format!("C:\\Users\\{user}\\caddy-atc-root-ca.crt");
    let wsl_cert_dest = format!("/mnt/c/Users/{user}/caddy-atc-root-ca.crt");

    println!();
    println!("Windows browsers (Chrome, Edge) use the Windows certificate store, not Linux's.");
    println!("To trust *.localhost certificates in your browser, install the CA cert on Windows:");
    println!();
    println!("Step 1 - Copy the certificate to the Windows filesystem:");
    println!();
    println!("  cp {} {}", cert_path.display(), wsl_cert_dest);
    println!();
    println!("Step 2 - Import into the Windows Trusted Root Certification Authorities store.");
    println!("         Run this from WSL (will open a Windows UAC prompt):");
    println!();
    println!("  certutil.exe -addstore Root {win_cert_path}");
    println!();
    println!("After importing, restart your browser for the change to take effect.");
    Ok(())
}

/// First real user directory under /mnt/c/Users, for copy-paste-ready
/// WSL instructions.
fn detect_windows_user() -> Option<String> {
    let entries = std::fs::read_dir("/mnt/c/Users").ok()?;
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match name.to_lowercase().as_str() {
            "public" | "default" | "default user" | "all users" => continue,
            _ => return Some(name),
        }
    }
    None
}

fn is_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|s| {
            let s = s.to_lowercase();
            s.contains("microsoft") || s.contains("wsl")
        })
        .unwrap_or(false)
}

/// Follow the watcher log (`tail -f` semantics).
pub async fn follow_log(paths: &Paths) -> anyhow::Result<()> {
    let status = tokio::process::Command::new("tail")
        .args(["-f", &paths.log_path().to_string_lossy()])
        .status()
        .await
        .context("running tail -f")?;
    if !status.success() {
        anyhow::bail!("tail exited with {}", status);
    }
    Ok(())
}

async fn run_compose(paths: &Paths, args: &[&str]) -> anyhow::Result<()> {
    let manifest = paths.gateway_compose_path();
    let output = tokio::process::Command::new("docker")
        .arg("compose")
        .arg("-f")
        .arg(&manifest)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .context("running docker compose")?;

    if !output.status.success() {
        anyhow::bail!(
            "docker compose {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    debug!(args = ?args, "docker compose succeeded");
    Ok(())
}
