use crate::dispatch::engine::DispatchEngine;
use crate::measure::target::TargetResolver;
use crate::runtime::config::RuntimeSettings;
use crate::runtime::fleet_config::FleetConfig;
use crate::runtime::pidfile::PidFile;
use crate::runtime::restart::RestartReason;
use crate::runtime::signals::LifecycleSignals;
use crate::runtime::telemetry::Telemetry;
use crate::supervisor::epoch::EpochHandles;
use crate::supervisor::plan::plan_jobs;
use crate::supervisor::pool::WorkerPool;
use crate::supervisor::worker::{MeasurementWorker, WorkerParams};
use crate::supervisor::EpochBackends;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How one configuration epoch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochOutcome {
    Quit,
    Reload,
    Restart(RestartReason),
    /// Every worker exited on its own.
    WorkersExited,
    /// No (kind, IP version) pair had both targets and nodes.
    Idle,
    /// The configuration could not be loaded or its backends built.
    ConfigError,
}

/// Loads the configuration, runs one worker per job and rebuilds everything on
/// reload or restart until quit is requested.
pub struct Supervisor {
    config_path: PathBuf,
    settings: RuntimeSettings,
    backends: Arc<dyn EpochBackends>,
    signals: LifecycleSignals,
    telemetry: Arc<Telemetry>,
    resolver: TargetResolver,
    shutdown: CancellationToken,
    pidfile: Option<PidFile>,
}

impl Supervisor {
    pub fn new(
        config_path: impl Into<PathBuf>,
        settings: RuntimeSettings,
        backends: Arc<dyn EpochBackends>,
        signals: LifecycleSignals,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            settings,
            backends,
            signals,
            telemetry: Arc::new(Telemetry::default()),
            resolver: TargetResolver::system(),
            shutdown: CancellationToken::new(),
            pidfile: None,
        }
    }

    /// Replaces the process-lifetime resolver, e.g. with a fixed lookup table.
    pub fn with_resolver(mut self, resolver: TargetResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Cancelling this token has the same effect as a quit signal.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Runs epochs until quit is requested. The PID file stays in place
    /// between epochs and is removed on the way out.
    pub async fn run(&mut self) -> Result<()> {
        self.run_epochs().await;
        self.release_pidfile();
        Ok(())
    }

    async fn run_epochs(&mut self) {
        loop {
            let outcome = self.run_epoch().await;
            tracing::info!(outcome = ?outcome, "configuration epoch ended");

            match outcome {
                EpochOutcome::Quit => return,
                EpochOutcome::Idle | EpochOutcome::ConfigError => {}
                EpochOutcome::Reload | EpochOutcome::Restart(_) | EpochOutcome::WorkersExited => {
                    if self.quitting() || self.sleep_or_quit(self.settings.epoch_pause()).await {
                        return;
                    }
                }
            }
        }
    }

    /// One load, plan, run and drain cycle.
    pub async fn run_epoch(&mut self) -> EpochOutcome {
        // A reload that arrives before the configuration is read is already covered.
        self.signals.take_reload();
        if self.quitting() {
            return EpochOutcome::Quit;
        }

        let config = match FleetConfig::load(&self.config_path) {
            Ok((config, located)) => {
                tracing::info!(path = %located.display(), "configuration loaded");
                config
            }
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "cannot load configuration");
                return self.idle(EpochOutcome::ConfigError).await;
            }
        };

        self.claim_pidfile(&config.general.pid);
        self.run_configured(&config).await
    }

    /// Writes the PID file unless it is already held at `path`. A changed
    /// path releases the old file first; a held file that vanished is rewritten.
    fn claim_pidfile(&mut self, path: &Path) {
        if path.exists() && self.pidfile.as_ref().is_some_and(|held| held.path() == path) {
            return;
        }
        self.release_pidfile();

        let pidfile = PidFile::new(path);
        match pidfile.write_current() {
            Ok(()) => self.pidfile = Some(pidfile),
            Err(err) => tracing::warn!(error = %format!("{err:#}"), "cannot write PID file"),
        }
    }

    fn release_pidfile(&mut self) {
        if let Some(pidfile) = self.pidfile.take() {
            if let Err(err) = pidfile.remove() {
                tracing::warn!(error = %format!("{err:#}"), "cannot remove PID file");
            }
        }
    }

    async fn run_configured(&mut self, config: &FleetConfig) -> EpochOutcome {
        let backends = self
            .backends
            .probe_service(config)
            .and_then(|service| Ok((service, self.backends.metrics_sink(config)?)));
        let (service, sink) = match backends {
            Ok(backends) => backends,
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "cannot set up probe service or metrics store");
                return self.idle(EpochOutcome::ConfigError).await;
            }
        };

        let jobs = plan_jobs(config, &mut self.resolver, service.as_ref()).await;
        if jobs.is_empty() {
            tracing::info!(
                retry_in = ?self.settings.idle_retry(),
                "no measurement has both targets and nodes"
            );
            return self.idle(EpochOutcome::Idle).await;
        }

        let epoch = EpochHandles::spawn(
            &self.shutdown,
            self.telemetry.clone(),
            self.settings.metrics_interval(),
        );
        let mut pool = WorkerPool::new();
        for job in jobs {
            pool.spawn(MeasurementWorker::new(WorkerParams {
                job,
                engine: DispatchEngine::new(self.settings.dispatch(), self.telemetry.clone()),
                service: service.clone(),
                sink: sink.clone(),
                telemetry: self.telemetry.clone(),
                restart: epoch.restart(),
                pass_interval: self.settings.pass_interval(),
                cancel: epoch.run_token.clone(),
            }));
        }
        tracing::info!(workers = pool.len(), "measurement workers started");

        let outcome = self.watch(&epoch, &pool).await;

        epoch.run_token.cancel();
        let summary = pool.drain(self.settings.drain_grace()).await;
        tracing::info!(
            finished = summary.finished,
            aborted = summary.aborted,
            "measurement workers drained"
        );
        epoch.shutdown().await;
        outcome
    }

    /// Liveness watch: one check per tick, woken early by signals and restart requests.
    async fn watch(&self, epoch: &EpochHandles, pool: &WorkerPool) -> EpochOutcome {
        let restart = epoch.restart();
        let mut ticker = time::interval(self.settings.liveness_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.signals.wait() => {}
                _ = restart.wait() => {}
                _ = self.shutdown.cancelled() => {}
            }

            if self.quitting() {
                tracing::info!("quit requested; stopping measurement workers");
                return EpochOutcome::Quit;
            }
            if self.signals.take_reload() {
                tracing::info!("reload requested; stopping measurement workers");
                return EpochOutcome::Reload;
            }
            if let Some(reason) = restart.reason() {
                return EpochOutcome::Restart(reason);
            }
            if pool.live_count() == 0 {
                tracing::info!("all measurement workers have exited");
                return EpochOutcome::WorkersExited;
            }
        }
    }

    async fn idle(&self, outcome: EpochOutcome) -> EpochOutcome {
        if self.sleep_or_quit(self.settings.idle_retry()).await {
            EpochOutcome::Quit
        } else {
            outcome
        }
    }

    async fn sleep_or_quit(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            quitting = self.signals.sleep_or_quit(delay) => quitting,
            _ = self.shutdown.cancelled() => true,
        }
    }

    fn quitting(&self) -> bool {
        self.shutdown.is_cancelled() || self.signals.quit_requested()
    }
}
