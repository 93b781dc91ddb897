use anyhow::Result;
use clap::Parser;
use probefleet::runtime::config::RuntimeSettings;
use probefleet::runtime::fleet_config::{FleetConfig, DEFAULT_CONFIG_FILE};
use probefleet::runtime::signals::LifecycleSignals;
use probefleet::runtime::telemetry::init_tracing;
use probefleet::supervisor::{DefaultBackends, Supervisor};
use std::path::PathBuf;
use std::sync::Arc;

/// Runs the configured measurements until SIGINT or SIGTERM; SIGHUP reloads.
#[derive(Debug, Parser)]
#[command(name = "probefleet", version)]
struct Cli {
    /// Fleet configuration file. Relative paths are also looked up in /etc and /usr/local/etc.
    #[arg(short, long, env = "PROBEFLEET_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, located) = FleetConfig::load(&cli.config)?;
    let _log_guard = init_tracing(&config.general.loglevel, config.general.logfile.as_deref())?;
    tracing::info!(config = %located.display(), "probefleet supervisor starting");

    let signals = LifecycleSignals::new();
    let _signal_task = signals.install()?;

    let settings = RuntimeSettings::builder().build()?;
    let mut supervisor = Supervisor::new(located, settings, Arc::new(DefaultBackends), signals);
    supervisor.run().await?;

    tracing::info!("probefleet supervisor stopped");
    Ok(())
}
