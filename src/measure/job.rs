use crate::measure::kind::{IpVersion, MeasurementKind};
use crate::measure::target::Target;
use anyhow::{bail, Result};

/// One (kind, IP version) combination: ordered targets and the nodes to
/// probe them from. Immutable once built.
#[derive(Debug, Clone)]
pub struct MeasurementJob {
    kind: MeasurementKind,
    ip_version: IpVersion,
    targets: Vec<Target>,
    nodes: Vec<String>,
}

impl MeasurementJob {
    pub fn new(
        kind: MeasurementKind,
        ip_version: IpVersion,
        targets: Vec<Target>,
        nodes: Vec<String>,
    ) -> Result<Self> {
        let series = kind.series(ip_version);
        if targets.is_empty() {
            bail!("{series} job has no resolved targets");
        }
        if nodes.is_empty() {
            bail!("{series} job has no nodes");
        }

        Ok(Self {
            kind,
            ip_version,
            targets,
            nodes,
        })
    }

    pub fn kind(&self) -> MeasurementKind {
        self.kind
    }

    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    pub fn series(&self) -> String {
        self.kind.series(self.ip_version)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn target_by_index(&self, index: usize) -> Option<&Target> {
        self.targets
            .iter()
            .find(|target| target.lookup_index() == index)
    }

    pub fn target_by_url(&self, url: &str) -> Option<&Target> {
        self.targets.iter().find(|target| target.url() == Some(url))
    }
}
