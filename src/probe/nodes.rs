//! Node enumeration.
//!
//! Agents register either with the probe service directory or as unix
//! sockets in a shared directory. The directory query wins whenever the
//! service supports it; the socket conventions are the fallback.

use crate::probe::service::{ProbeError, ProbeService};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Marker separating an agent name from the rest of its socket file name.
const AGENT_SOCKET_MARKER: &str = "ark-";

/// Every reachable agent name, sorted and deduplicated.
pub async fn enumerate_nodes(service: &dyn ProbeService, socket_dir: &Path) -> Result<Vec<String>> {
    match service.list_directory().await {
        Ok(mut nodes) => {
            nodes.sort();
            nodes.dedup();
            Ok(nodes)
        }
        Err(ProbeError::Unsupported(_)) => scan_agent_sockets(socket_dir),
        Err(err) => Err(err).context("probe directory query failed"),
    }
}

/// Maps configured node names to connectable node identifiers.
pub async fn resolve_configured_nodes(
    service: &dyn ProbeService,
    socket_dir: &Path,
    configured: &[String],
) -> Result<Vec<String>> {
    match service.list_directory().await {
        Ok(directory) => Ok(configured
            .iter()
            .filter(|name| directory.iter().any(|entry| entry_matches(entry, name)))
            .cloned()
            .collect()),
        Err(ProbeError::Unsupported(_)) => {
            let mut sockets = Vec::new();
            for name in configured {
                sockets.extend(node_sockets(socket_dir, name)?);
            }
            Ok(sockets)
        }
        Err(err) => Err(err).context("probe directory query failed"),
    }
}

fn entry_matches(entry: &str, name: &str) -> bool {
    entry == name
        || entry
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with('-'))
}

/// Socket paths in `socket_dir` belonging to `name` (`<name>-*`).
pub fn node_sockets(socket_dir: &Path, name: &str) -> Result<Vec<String>> {
    let prefix = format!("{name}-");
    let mut sockets: Vec<String> = read_names(socket_dir)?
        .into_iter()
        .filter(|file| file.starts_with(&prefix))
        .map(|file| socket_dir.join(file).to_string_lossy().into_owned())
        .collect();
    sockets.sort();
    Ok(sockets)
}

/// Agent names derived from `*.ark-*` sockets, truncated after the marker's `ark`.
pub fn scan_agent_sockets(socket_dir: &Path) -> Result<Vec<String>> {
    let mut nodes: Vec<String> = read_names(socket_dir)?
        .into_iter()
        .filter_map(|file| {
            let marker = file.find(&format!(".{AGENT_SOCKET_MARKER}"))? + 1;
            Some(file[..marker + AGENT_SOCKET_MARKER.len() - 1].to_owned())
        })
        .collect();
    nodes.sort();
    nodes.dedup();
    Ok(nodes)
}

fn read_names(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read socket directory {}", dir.display()))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}
