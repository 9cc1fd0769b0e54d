//! Watcher singleton guard.
//!
//! The watcher records its PID under `~/.caddy-atc/watcher.pid`. Probing is
//! two-stage: a zero-signal `kill` establishes the process is alive, then
//! the POSIX `ps` utility confirms the command name still belongs to this
//! program. The second stage defends against PID reuse after a crash:
//! without it, `down` could SIGTERM an innocent process that inherited the
//! recorded number. `/proc` is deliberately not consulted (macOS has none).

use anyhow::Context;
use tracing::warn;

use crate::paths::Paths;

/// Substring expected in the command name of a genuine watcher process.
const PROGRAM_NAME: &str = "caddy-atc";

/// Record this process's PID.
pub fn write(paths: &Paths) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    let pid = std::process::id();
    std::fs::write(paths.pid_path(), format!("{pid}\n"))
        .with_context(|| format!("writing PID file {}", paths.pid_path().display()))
}

/// Remove the PID file; missing file is fine.
pub fn remove(paths: &Paths) {
    let _ = std::fs::remove_file(paths.pid_path());
}

/// The recorded PID, if the file exists and parses.
pub fn read(paths: &Paths) -> Option<i32> {
    let data = std::fs::read_to_string(paths.pid_path()).ok()?;
    data.trim().parse().ok()
}

/// Whether a previously spawned watcher is still running. Stale PID files
/// (dead process, or a PID recycled by an unrelated program) are removed.
pub fn is_watcher_running(paths: &Paths) -> bool {
    let Some(pid) = read(paths) else {
        return false;
    };

    if !process_alive(pid) {
        remove(paths);
        return false;
    }

    if !is_our_process(pid) {
        return false;
    }

    true
}

/// Signal the recorded watcher to stop, after verifying it really is one
/// of ours. The PID file is removed either way.
pub fn stop_watcher(paths: &Paths) {
    let Some(pid) = read(paths) else {
        return;
    };

    if !process_alive(pid) {
        remove(paths);
        return;
    }

    if !is_our_process(pid) {
        warn!(pid, "PID file names a foreign process, removing stale PID file");
        remove(paths);
        return;
    }

    if terminate(pid) {
        println!("Watcher stopped.");
    } else {
        warn!(pid, "could not stop watcher");
    }
    remove(paths);
}

/// Zero-signal probe: does the PID name a live process?
#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: i32) -> bool {
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_pid: i32) -> bool {
    false
}

/// Ask `ps` for the command name of a PID and check it is this program.
/// Unreachable `ps` is treated as a pass; the liveness probe already ran.
fn is_our_process(pid: i32) -> bool {
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output();
    match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).contains(PROGRAM_NAME)
        }
        Ok(_) => false,
        Err(_) => true,
    }
}
