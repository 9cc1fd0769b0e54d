//! Host-port stripping for compose manifests.
//!
//! When the gateway supplies ingress, host-port bindings only cause
//! conflicts, so the `start` flow rewrites each compose file with every
//! service's `ports:` key removed (optionally keeping a named subset).
//!
//! The rewrite must not disturb anything else: comments, anchors, key
//! order, flow style, and `${...}` interpolations all survive. The document
//! is first checked with the YAML parser (malformed input is an error,
//! non-mapping roots and documents without a `services` mapping pass
//! through untouched); the edit itself is line-oriented so that every line
//! outside a removed `ports:` block is emitted byte-for-byte.

use std::collections::HashSet;

use anyhow::Context;

/// Remove `ports:` keys from every service not named in `keep`.
/// Idempotent; the output of one pass is a fixed point.
pub fn strip_ports(input: &[u8], keep: &[String]) -> anyhow::Result<Vec<u8>> {
    let doc: serde_yaml::Value = serde_yaml::from_slice(input).context("parsing YAML")?;

    let has_services = doc
        .as_mapping()
        .and_then(|m| m.get(&serde_yaml::Value::String("services".to_string())))
        .map(|v| v.is_mapping())
        .unwrap_or(false);
    if !has_services {
        return Ok(input.to_vec());
    }

    let text = std::str::from_utf8(input).context("compose file is not valid UTF-8")?;
    let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();

    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut out = String::with_capacity(text.len());

    // Indent of service entries under `services:`, and of keys within a
    // service block. Both are learned from the first line at each level.
    let mut in_services = false;
    let mut service_indent: Option<usize> = None;
    let mut key_indent: Option<usize> = None;
    let mut keep_current_service = false;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_end_matches(['\n', '\r']).trim_start();
        let blank_or_comment = trimmed.is_empty() || trimmed.starts_with('#');
        let indent = indent_of(line);

        if !blank_or_comment {
            if indent == 0 {
                in_services = is_key(trimmed, "services");
                service_indent = None;
                key_indent = None;
            } else if in_services {
                let svc_indent = *service_indent.get_or_insert(indent);
                if indent == svc_indent {
                    let name = key_name(trimmed);
                    keep_current_service = keep.contains(name);
                    key_indent = None;
                } else if !keep_current_service {
                    let k_indent = *key_indent.get_or_insert(indent);
                    if indent == k_indent && is_key(trimmed, "ports") {
                        // Drop the key line and its indented continuation.
                        i = skip_block(&lines, i + 1, indent);
                        continue;
                    }
                }
            }
        }

        out.push_str(line);
        i += 1;
    }

    Ok(out.into_bytes())
}

/// Index of the first line after `start` that no longer belongs to a block
/// whose key sat at `key_indent`. Blank and comment lines are consumed only
/// when deeper block content follows them.
fn skip_block(lines: &[&str], start: usize, key_indent: usize) -> usize {
    let mut i = start;
    while i < lines.len() {
        let trimmed = lines[i].trim_end_matches(['\n', '\r']).trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            match next_content_indent(lines, i + 1) {
                Some(next) if next > key_indent => {
                    i += 1;
                    continue;
                }
                _ => break,
            }
        }
        if indent_of(lines[i]) > key_indent {
            i += 1;
        } else {
            break;
        }
    }
    i
}

fn next_content_indent(lines: &[&str], from: usize) -> Option<usize> {
    lines[from..].iter().find_map(|line| {
        let trimmed = line.trim_end_matches(['\n', '\r']).trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            None
        } else {
            Some(indent_of(line))
        }
    })
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

/// Whether a trimmed line introduces the mapping key `key`, allowing an
/// inline value or trailing comment (`ports:`, `ports: ["80:80"]`,
/// `ports: # note`).
fn is_key(trimmed: &str, key: &str) -> bool {
    key_name(trimmed) == key
}

fn key_name(trimmed: &str) -> &str {
    let name = trimmed.split(':').next().unwrap_or("");
    name.trim_matches(|c| c == '"' || c == '\'')
}
