//! Well-known filesystem locations under `~/.caddy-atc`.
//!
//! Everything the tool persists lives under one base directory: the project
//! registry and its lock, the generated Caddyfile (mounted read-only into
//! the gateway container), the watcher log and PID file, and the extracted
//! root CA certificate. Tests construct [`Paths`] over a tempdir.

use std::path::{Path, PathBuf};

/// Resolved filesystem layout for all caddy-atc state.
#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    /// Layout rooted at the user's home directory (`~/.caddy-atc`).
    ///
    /// Falls back to the system temp directory when `$HOME` is unset.
    pub fn resolve() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            base: home.join(".caddy-atc"),
        }
    }

    /// Layout rooted at an explicit base directory (used by tests).
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn home(&self) -> &Path {
        &self.base
    }

    /// Directory holding the generated Caddyfile, mounted into the gateway.
    pub fn caddyfile_dir(&self) -> PathBuf {
        self.base.join("caddyfile")
    }

    pub fn caddyfile_path(&self) -> PathBuf {
        self.caddyfile_dir().join("Caddyfile")
    }

    pub fn projects_path(&self) -> PathBuf {
        self.base.join("projects.yml")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base.join("projects.lock")
    }

    pub fn log_path(&self) -> PathBuf {
        self.base.join("watcher.log")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.base.join("watcher.pid")
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.base.join("caddy-atc-root-ca.crt")
    }

    /// Where the embedded gateway compose manifest is materialized.
    pub fn gateway_compose_path(&self) -> PathBuf {
        self.base.join("docker-compose.yml")
    }

    /// Create the base directory and the Caddyfile subdirectory.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [self.base.clone(), self.caddyfile_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow::anyhow!("creating directory {}: {}", dir.display(), e))?;
        }
        Ok(())
    }
}

/// Process environment minus any `KEY=` assignments for the given key,
/// so callers can append a fresh value without duplicates.
pub fn filter_env(key: &str) -> Vec<(String, String)> {
    let key_upper = key.to_uppercase();
    std::env::vars()
        .filter(|(k, _)| k.to_uppercase() != key_upper)
        .collect()
}
