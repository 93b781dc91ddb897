use anyhow::{Context, Result};
use clap::Parser;
use probefleet::controller::{
    HttpManagementClient, ManagementApi, ProcessControl, ProcessSettings, ReconcileSettings,
    Reconciler, LOGIN_ENV, PASSWORD_ENV,
};
use probefleet::probe::local::LocalProbeService;
use probefleet::runtime::fleet_config::{FleetConfig, DEFAULT_CONFIG_FILE};
use probefleet::runtime::signals::LifecycleSignals;
use probefleet::runtime::telemetry::init_tracing;
use std::path::PathBuf;
use std::sync::Arc;

/// Keeps the fleet configuration in sync with the management API and starts,
/// stops and reloads the supervisor around test windows.
#[derive(Debug, Parser)]
#[command(name = "probefleet-controller", version)]
struct Cli {
    /// Fleet configuration file, rewritten on every upstream change.
    #[arg(short, long, env = "PROBEFLEET_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[arg(long, env = LOGIN_ENV, hide_env_values = true)]
    login: String,

    #[arg(long, env = PASSWORD_ENV, hide_env_values = true)]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, located) = FleetConfig::load(&cli.config)?;
    let _log_guard =
        init_tracing(&config.controller.loglevel, config.controller.logfile.as_deref())?;
    tracing::info!(config = %located.display(), "probefleet controller starting");

    let client = HttpManagementClient::new(config.management_api()?)?;
    client
        .authenticate(&cli.login, &cli.password)
        .await
        .context("cannot authenticate to the management API")?;

    let service = Arc::new(LocalProbeService::from_section(&config.probe));
    let control = Arc::new(ProcessControl::new(ProcessSettings::new(
        config.general.pid.clone(),
        config.controller.supervisor_command.clone(),
        config.controller.supervisor_output.clone(),
    )));
    let settings = ReconcileSettings {
        window_id: config.controller.window_id,
        ..ReconcileSettings::default()
    };

    let signals = LifecycleSignals::new();
    let _signal_task = signals.install()?;

    let mut reconciler = Reconciler::new(
        Arc::new(client),
        control,
        service,
        located,
        config.general.socket_dir.clone(),
        settings,
    )
    .with_shutdown(signals.quit_token());
    reconciler.run(&signals).await?;

    tracing::info!("probefleet controller stopped");
    Ok(())
}
