//! The `start` / `stop` flows: run a project's compose stack with host
//! ports stripped, so many projects can run side by side behind the
//! gateway.
//!
//! `start` auto-adopts the directory if needed, ensures the gateway is up,
//! writes port-stripped copies of the compose files next to the originals,
//! and runs `docker compose up -d` (or a user-supplied command) with
//! `COMPOSE_FILE` pointing at the stripped copies.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use crate::adopt;
use crate::compose::COMPOSE_FILE_NAMES;
use crate::docker;
use crate::gateway;
use crate::paths::{self, Paths};
use crate::store::Registry;
use crate::strip;

/// Prefix for generated stripped compose files.
const STRIPPED_PREFIX: &str = ".caddy-atc-compose";

/// Options for the start flow.
#[derive(Debug, Default)]
pub struct Options {
    /// Project directory.
    pub dir: PathBuf,
    /// Service names whose host ports should be kept.
    pub keep_ports: Vec<String>,
    /// User command to run instead of `docker compose up -d`.
    pub command: Vec<String>,
}

/// Compose files Docker Compose would load for `dir`: the `COMPOSE_FILE`
/// environment variable when set (every entry must exist), otherwise the
/// base file plus an auto-detected `.override` sibling.
pub fn detect_compose_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if let Ok(env_val) = std::env::var("COMPOSE_FILE") {
        if !env_val.is_empty() {
            let mut files = Vec::new();
            for part in env_val.split(':') {
                let path = if Path::new(part).is_absolute() {
                    PathBuf::from(part)
                } else {
                    dir.join(part)
                };
                if !path.exists() {
                    anyhow::bail!("COMPOSE_FILE references missing file: {}", path.display());
                }
                files.push(path);
            }
            if files.is_empty() {
                anyhow::bail!("COMPOSE_FILE is set but contains no valid files");
            }
            return Ok(files);
        }
    }

    let base = COMPOSE_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
        .ok_or_else(|| {
            anyhow::anyhow!("no docker-compose.yml or compose.yml found in {}", dir.display())
        })?;

    let mut files = vec![base.clone()];
    if let Some(override_file) = find_override_file(&base) {
        files.push(override_file);
    }
    Ok(files)
}

/// `docker-compose.yml` -> `docker-compose.override.yml`, if present.
fn find_override_file(base: &Path) -> Option<PathBuf> {
    let stem = base.file_stem()?.to_string_lossy();
    let ext = base.extension()?.to_string_lossy();
    let candidate = base.with_file_name(format!("{stem}.override.{ext}"));
    candidate.is_file().then_some(candidate)
}

/// Write port-stripped copies of the given compose files, returning their
/// paths in the same order.
pub fn generate_stripped_files(
    originals: &[PathBuf],
    keep_ports: &[String],
) -> anyhow::Result<Vec<PathBuf>> {
    let mut stripped = Vec::new();

    for (i, orig) in originals.iter().enumerate() {
        let data = std::fs::read(orig).with_context(|| format!("reading {}", orig.display()))?;
        let out = strip::strip_ports(&data, keep_ports)
            .with_context(|| format!("stripping ports from {}", orig.display()))?;

        let name = stripped_filename(i);
        let out_path = orig.with_file_name(name);
        std::fs::write(&out_path, out)
            .with_context(|| format!("writing {}", out_path.display()))?;
        stripped.push(out_path);
    }

    Ok(stripped)
}

fn stripped_filename(index: usize) -> String {
    if index == 0 {
        format!("{STRIPPED_PREFIX}.yml")
    } else {
        format!("{STRIPPED_PREFIX}.override.yml")
    }
}

/// The `COMPOSE_FILE` value for a set of compose files.
pub fn build_compose_file_env(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Run the start workflow: auto-adopt, ensure gateway, strip ports, run.
pub async fn run(paths: &Paths, opts: Options) -> anyhow::Result<()> {
    let abs_dir = std::fs::canonicalize(&opts.dir)
        .with_context(|| format!("resolving directory {}", opts.dir.display()))?;

    // 1. Auto-adopt if not already adopted
    let registry = Registry::load(paths)?;
    let project_name = abs_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !registry.projects.contains_key(&project_name) {
        println!("Auto-adopting {project_name} ({project_name}.localhost)...");
        adopt::adopt(paths, &abs_dir, "", false).context("auto-adopt failed")?;
    }

    // 2. Ensure gateway is running
    let client = docker::connect().await?;
    if !gateway::is_running(&client).await? {
        println!("Starting caddy-atc gateway...");
        gateway::up(paths).await?;
    }

    // 3-4. Detect compose files and generate stripped copies
    let compose_files = detect_compose_files(&abs_dir)?;
    let stripped_files = generate_stripped_files(&compose_files, &opts.keep_ports)?;
    println!(
        "Generated {} (ports stripped)",
        stripped_files[0]
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );

    // 5. COMPOSE_FILE pointing at the stripped copies, without duplicates
    let compose_file_env = build_compose_file_env(&stripped_files);
    let env = paths::filter_env("COMPOSE_FILE");

    // 6. Run the default bring-up or hand over to the user's command
    if opts.command.is_empty() {
        run_default(&abs_dir, env, &compose_file_env).await
    } else {
        exec_user_command(&abs_dir, env, &compose_file_env, &opts.command)
    }
}

async fn run_default(
    dir: &Path,
    env: Vec<(String, String)>,
    compose_file_env: &str,
) -> anyhow::Result<()> {
    println!("Running: docker compose up -d");

    let status = tokio::process::Command::new("docker")
        .args(["compose", "up", "-d"])
        .current_dir(dir)
        .env_clear()
        .envs(env)
        .env("COMPOSE_FILE", compose_file_env)
        .status()
        .await
        .context("docker compose up")?;
    if !status.success() {
        anyhow::bail!("docker compose up exited with {}", status);
    }

    println!("\nContainers started. The caddy-atc watcher will set up routes automatically.");
    println!("Tip: Add .caddy-atc-compose*.yml to your .gitignore");
    Ok(())
}

/// Replace this process with the user's command; signals go straight to it.
#[cfg(unix)]
fn exec_user_command(
    dir: &Path,
    env: Vec<(String, String)>,
    compose_file_env: &str,
    args: &[String],
) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    println!("Running: {}", args.join(" "));

    let err = std::process::Command::new(&args[0])
        .args(&args[1..])
        .current_dir(dir)
        .env_clear()
        .envs(env)
        .env("COMPOSE_FILE", compose_file_env)
        .exec();
    // exec only returns on failure
    Err(anyhow::anyhow!("running {}: {}", args[0], err))
}

#[cfg(not(unix))]
fn exec_user_command(
    dir: &Path,
    env: Vec<(String, String)>,
    compose_file_env: &str,
    args: &[String],
) -> anyhow::Result<()> {
    let status = std::process::Command::new(&args[0])
        .args(&args[1..])
        .current_dir(dir)
        .env_clear()
        .envs(env)
        .env("COMPOSE_FILE", compose_file_env)
        .status()
        .with_context(|| format!("running {}", args[0]))?;
    if !status.success() {
        anyhow::bail!("{} exited with {}", args[0], status);
    }
    Ok(())
}

/// Stop a project started through the stripped compose files, then clean
/// the generated files up.
pub async fn stop(dir: &Path) -> anyhow::Result<()> {
    let abs_dir = std::fs::canonicalize(dir)
        .with_context(|| format!("resolving directory {}", dir.display()))?;

    let stripped_path = abs_dir.join(format!("{STRIPPED_PREFIX}.yml"));
    let override_path = abs_dir.join(format!("{STRIPPED_PREFIX}.override.yml"));

    if !stripped_path.exists() {
        println!("No stripped compose file found. Running: docker compose down");
        let status = tokio::process::Command::new("docker")
            .args(["compose", "down"])
            .current_dir(&abs_dir)
            .status()
            .await
            .context("docker compose down")?;
        if !status.success() {
            anyhow::bail!("docker compose down exited with {}", status);
        }
        return Ok(());
    }

    let mut compose_file_env = stripped_path.to_string_lossy().into_owned();
    if override_path.exists() {
        compose_file_env = format!("{}:{}", compose_file_env, override_path.to_string_lossy());
    }
    let env = paths::filter_env("COMPOSE_FILE");

    println!("Running: docker compose down");
    let status = tokio::process::Command::new("docker")
        .args(["compose", "down"])
        .current_dir(&abs_dir)
        .env_clear()
        .envs(env)
        .env("COMPOSE_FILE", &compose_file_env)
        .status()
        .await
        .context("docker compose down")?;
    if !status.success() {
        anyhow::bail!("docker compose down exited with {}", status);
    }

    let _ = std::fs::remove_file(&stripped_path);
    let _ = std::fs::remove_file(&override_path);
    info!("Stripped compose files cleaned up");
    println!("Stripped compose files cleaned up.");

    Ok(())
}
