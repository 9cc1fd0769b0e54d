//! Input validation for values interpolated into the generated Caddyfile.
//!
//! Hostnames, container names, and ports all end up inside the Caddyfile
//! verbatim. These predicates are the only guard against a crafted value
//! injecting directives into the gateway configuration, so every caller
//! re-checks immediately before interpolation, not just at ingestion.

use std::sync::LazyLock;

use regex::Regex;

/// Safe hostnames and container/service names: alphanumeric, dots, hyphens,
/// underscores. Must start with an alphanumeric character.
static VALID_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*$").expect("valid name regex"));

/// Maximum hostname length per RFC 1035.
const MAX_HOSTNAME_LEN: usize = 253;

/// Check that a hostname is safe to interpolate into a Caddyfile.
pub fn hostname(s: &str) -> anyhow::Result<()> {
    if s.is_empty() {
        anyhow::bail!("hostname cannot be empty");
    }
    if s.len() > MAX_HOSTNAME_LEN {
        anyhow::bail!("hostname too long: {} chars (max {})", s.len(), MAX_HOSTNAME_LEN);
    }
    if !VALID_NAME.is_match(s) {
        anyhow::bail!(
            "invalid hostname {:?}: must match [a-zA-Z0-9][a-zA-Z0-9._-]*",
            s
        );
    }
    Ok(())
}

/// Check that a container name is safe for Caddyfile use.
pub fn container_name(s: &str) -> anyhow::Result<()> {
    if s.is_empty() {
        anyhow::bail!("container name cannot be empty");
    }
    if !VALID_NAME.is_match(s) {
        anyhow::bail!(
            "invalid container name {:?}: must match [a-zA-Z0-9][a-zA-Z0-9._-]*",
            s
        );
    }
    Ok(())
}

/// Check that a port string is a valid numeric port.
pub fn port(s: &str) -> anyhow::Result<()> {
    if s.is_empty() {
        anyhow::bail!("port cannot be empty");
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        anyhow::bail!("invalid port {:?}: must be numeric", s);
    }
    Ok(())
}
