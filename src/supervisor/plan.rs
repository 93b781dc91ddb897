use crate::measure::job::MeasurementJob;
use crate::measure::target::{ResolutionError, TargetResolver};
use crate::probe::nodes::resolve_configured_nodes;
use crate::probe::service::ProbeService;
use crate::runtime::fleet_config::FleetConfig;

/// Builds at most one job per configured (kind, IP version) pair.
///
/// Unresolvable targets are skipped. Pairs left without targets or without
/// reachable nodes produce no job.
pub async fn plan_jobs(
    config: &FleetConfig,
    resolver: &mut TargetResolver,
    service: &dyn ProbeService,
) -> Vec<MeasurementJob> {
    let mut jobs: Vec<MeasurementJob> = Vec::new();

    for (kind, ip_version, section) in config.series() {
        let series = kind.series(ip_version);
        if jobs.iter().any(|job| job.series() == series) {
            continue;
        }

        let mut targets = Vec::new();
        for (raw, party) in section.targets() {
            match resolver.resolve(kind, raw, party, ip_version).await {
                Ok(target) => targets.push(target),
                Err(err @ ResolutionError::NoAddress { .. }) => {
                    tracing::info!(
                        kind = %kind,
                        ip_version = %ip_version,
                        target = raw,
                        error = %err,
                        "skipping target"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        kind = %kind,
                        ip_version = %ip_version,
                        target = raw,
                        error = %err,
                        "skipping target"
                    );
                }
            }
        }

        let nodes =
            match resolve_configured_nodes(service, &config.general.socket_dir, &section.nodes)
                .await
            {
                Ok(nodes) => nodes,
                Err(err) => {
                    tracing::warn!(series = %series, error = %err, "cannot enumerate nodes");
                    Vec::new()
                }
            };

        match MeasurementJob::new(kind, ip_version, targets, nodes) {
            Ok(job) => {
                tracing::info!(
                    series = %series,
                    targets = job.targets().len(),
                    nodes = job.nodes().len(),
                    "measurement will run"
                );
                jobs.push(job);
            }
            Err(err) => {
                tracing::info!(series = %series, reason = %err, "measurement not started");
            }
        }
    }

    jobs
}
