//! Persistent project registry (`~/.caddy-atc/projects.yml`).
//!
//! The registry maps project names (directory leaf names) to adopted project
//! records. Mutations go through [`load_and_modify`], which holds an
//! exclusive advisory lock on a sibling lock file around the entire
//! load-modify-save cycle so concurrent adopt/unadopt invocations from
//! separate processes cannot lose updates. Saves are temp-file-plus-rename,
//! so readers never observe a torn registry.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::paths::Paths;

/// A single adopted project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    /// Absolute path to the project directory.
    pub dir: PathBuf,
    /// Docker Compose project name (directory leaf by default, matching
    /// the `com.docker.compose.project` label Compose applies).
    pub compose_project: String,
    /// Base hostname assigned to the primary service.
    pub hostname: String,
    /// Service name to assigned hostname.
    pub services: BTreeMap<String, String>,
}

impl Project {
    /// Hostname for a service within this project: the recorded assignment,
    /// or `<service>.<base_hostname>` for services adopted after the fact.
    pub fn resolve_hostname(&self, service: &str) -> String {
        match self.services.get(service) {
            Some(hostname) => hostname.clone(),
            None => format!("{}.{}", service, self.hostname),
        }
    }
}

/// The top-level registry document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registry {
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
}

impl Registry {
    /// Read the registry from disk. A missing file is an empty registry.
    pub fn load(paths: &Paths) -> anyhow::Result<Self> {
        let path = paths.projects_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        serde_yaml::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write the registry atomically (temp file in the same directory, then
    /// rename over the target).
    pub fn save(&self, paths: &Paths) -> anyhow::Result<()> {
        paths.ensure_dirs()?;
        let data = serde_yaml::to_string(self).context("serializing registry")?;
        atomic_write(&paths.projects_path(), data.as_bytes())
    }

    /// Look up a project by its Docker Compose project name. Linear scan;
    /// the registry holds a handful of entries.
    pub fn find_by_compose_project(&self, compose_name: &str) -> Option<(&str, &Project)> {
        self.projects
            .iter()
            .find(|(_, p)| p.compose_project == compose_name)
            .map(|(name, p)| (name.as_str(), p))
    }
}

/// Load the registry under an exclusive file lock, apply `f`, and save the
/// result atomically. The lock is held around the whole read-modify-write.
pub fn load_and_modify<F>(paths: &Paths, f: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut Registry) -> anyhow::Result<()>,
{
    paths.ensure_dirs()?;

    let lock_path = paths.lock_path();
    let lock_file = File::options()
        .create(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("opening lock file {}", lock_path.display()))?;
    let _guard = LockGuard::acquire(&lock_file)
        .with_context(|| format!("acquiring registry lock {}", lock_path.display()))?;

    let mut registry = Registry::load(paths)?;
    f(&mut registry)?;
    registry.save(paths)
}

/// Holds an exclusive `flock` for the lifetime of the guard. The lock is
/// released when the guard drops; closing the descriptor would release it
/// anyway, but the explicit unlock keeps the window tight.
struct LockGuard<'a> {
    file: &'a File,
}

impl<'a> LockGuard<'a> {
    #[cfg(unix)]
    fn acquire(file: &'a File) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { file })
    }

    #[cfg(not(unix))]
    fn acquire(file: &'a File) -> anyhow::Result<Self> {
        Ok(Self { file })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        }
        let _ = self.file;
    }
}

/// Write `data` to a temp file next to `path`, then rename it into place.
pub fn atomic_write(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent directory for {}", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(data)
        .with_context(|| format!("writing temp file for {}", path.display()))?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("renaming temp file over {}", path.display()))?;
    Ok(())
}
