//! The YAML fleet configuration shared by the supervisor and the controller.
//!
//! ```yaml
//! general:
//!   loglevel: info
//!   pid: /run/probefleet.pid
//!   socket_dir: /var/run/remote-controller
//! database:
//!   url: http://influx:8086
//!   token: secret
//!   org: fleet
//!   bucket: probes
//! measurements:
//!   ping4:
//!     partyA: [192.0.2.1, www.example.com]
//!     nodes: [ams-nl.ark, bos-us.ark]
//! ```

use crate::measure::kind::{IpVersion, MeasurementKind};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "probefleet.yaml";
const CONFIG_SEARCH_DIRS: [&str; 2] = ["/etc", "/usr/local/etc"];
const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "warning", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub general: GeneralSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub measurements: BTreeMap<String, MeasurementSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logfile: Option<PathBuf>,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    #[serde(default = "default_pid")]
    pub pid: PathBuf,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Base URL of the management API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_api: Option<String>,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            logfile: None,
            loglevel: default_loglevel(),
            pid: default_pid(),
            socket_dir: default_socket_dir(),
            management_api: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logfile: Option<PathBuf>,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Command line used to start the supervisor.
    #[serde(default = "default_supervisor_command")]
    pub supervisor_command: Vec<String>,
    /// File receiving the supervisor's stdout and stderr.
    #[serde(default = "default_supervisor_output")]
    pub supervisor_output: PathBuf,
    /// Activation window polled on the management API.
    #[serde(default = "default_window_id")]
    pub window_id: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            logfile: None,
            loglevel: default_loglevel(),
            supervisor_command: default_supervisor_command(),
            supervisor_output: default_supervisor_output(),
            window_id: default_window_id(),
        }
    }
}

/// Where probe nodes are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeDiscovery {
    /// The probe service lists `local_nodes`.
    #[default]
    Directory,
    /// Agents are found as sockets in `general.socket_dir`.
    Sockets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSection {
    #[serde(default)]
    pub discovery: NodeDiscovery,
    /// Node names served by the local probe backend.
    #[serde(default = "default_local_nodes")]
    pub local_nodes: Vec<String>,
    #[serde(default = "default_ping_port")]
    pub ping_port: u16,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            discovery: NodeDiscovery::default(),
            local_nodes: default_local_nodes(),
            ping_port: default_ping_port(),
        }
    }
}

/// Targets per party plus the nodes to run them from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementSection {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(flatten)]
    pub parties: BTreeMap<String, Vec<String>>,
}

impl MeasurementSection {
    /// `(target, party)` pairs in party order, then configured order.
    pub fn targets(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.parties.iter().flat_map(|(party, targets)| {
            targets
                .iter()
                .map(move |target| (target.as_str(), party.as_str()))
        })
    }
}

fn default_loglevel() -> String {
    "info".into()
}

fn default_pid() -> PathBuf {
    PathBuf::from("probefleet.pid")
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/run/remote-controller")
}

fn default_supervisor_command() -> Vec<String> {
    vec!["probefleet".into()]
}

fn default_supervisor_output() -> PathBuf {
    PathBuf::from("log/probefleet_stdout.log")
}

fn default_window_id() -> u64 {
    1
}

fn default_local_nodes() -> Vec<String> {
    vec!["local".into()]
}

fn default_ping_port() -> u16 {
    crate::probe::local::DEFAULT_PING_PORT
}

impl FleetConfig {
    /// Finds `path`, trying it as given and then in the system config directories.
    pub fn locate(path: &Path) -> Result<PathBuf> {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }

        if path.is_relative() {
            let file_name = path.file_name().unwrap_or(path.as_os_str());
            for dir in CONFIG_SEARCH_DIRS {
                let candidate = Path::new(dir).join(file_name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        bail!(
            "configuration file {} not found (also searched {})",
            path.display(),
            CONFIG_SEARCH_DIRS.join(", ")
        )
    }

    /// Locates, parses and validates the configuration.
    pub fn load(path: &Path) -> Result<(Self, PathBuf)> {
        let located = Self::locate(path)?;
        let raw = fs::read_to_string(&located)
            .with_context(|| format!("failed to read {}", located.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("invalid configuration in {}", located.display()))?;
        Ok((config, located))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration back, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let rendered = serde_yaml::to_string(self).context("failed to render configuration")?;
        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, rendered).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure_log_level(&self.general.loglevel, "general.loglevel")?;
        ensure_log_level(&self.controller.loglevel, "controller.loglevel")?;

        for series in self.measurements.keys() {
            if MeasurementKind::parse_series(series).is_none() {
                bail!("measurements.{series} is not a known measurement series");
            }
        }

        if let Some(url) = &self.database.url {
            ensure_http_url(url, "database.url")?;
        }

        if let Some(url) = &self.general.management_api {
            ensure_http_url(url, "general.management_api")?;
        }

        if self.controller.supervisor_command.is_empty() {
            bail!("controller.supervisor_command cannot be empty");
        }

        Ok(())
    }

    /// Configured sections in kind, then IP version order.
    pub fn series(&self) -> Vec<(MeasurementKind, IpVersion, &MeasurementSection)> {
        let mut series = Vec::new();
        for kind in MeasurementKind::ALL {
            for ip_version in IpVersion::ALL {
                if let Some(section) = self.measurements.get(&kind.series(ip_version)) {
                    series.push((kind, ip_version, section));
                }
            }
        }
        series
    }

    pub fn management_api(&self) -> Result<&str> {
        self.general
            .management_api
            .as_deref()
            .context("general.management_api is required")
    }
}

fn ensure_log_level(level: &str, field: &str) -> Result<()> {
    if !LOG_LEVELS.contains(&level.trim().to_ascii_lowercase().as_str()) {
        bail!("{field} must be one of {}", LOG_LEVELS.join(", "));
    }
    Ok(())
}

fn ensure_http_url(url: &str, field: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("{field} must start with http:// or https://");
    }
    Ok(())
}
