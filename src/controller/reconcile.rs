//! Periodic reconciliation of the fleet with the management API.
//!
//! Each step pushes the node inventory when it changed, starts or stops the
//! supervisor to follow the activation window, and rewrites the configuration
//! when the window's `updated_at` moved forward.

use crate::controller::api::{ApiError, ManagementApi};
use crate::controller::assemble::assemble_measurements;
use crate::controller::process::SupervisorControl;
use crate::probe::nodes::enumerate_nodes;
use crate::probe::service::ProbeService;
use crate::runtime::backoff::{retry, RetryDisposition, RetryPolicy};
use crate::runtime::fleet_config::FleetConfig;
use crate::runtime::signals::LifecycleSignals;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_PUSH_ATTEMPTS: usize = 3;
const DEFAULT_PUSH_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_PUSH_BACKOFF_MAX: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub loop_interval: Duration,
    /// Wait after a transient API failure.
    pub retry_delay: Duration,
    pub push_attempts: usize,
    pub push_backoff: Duration,
    pub push_backoff_max: Duration,
    pub window_id: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            loop_interval: DEFAULT_LOOP_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            push_attempts: DEFAULT_PUSH_ATTEMPTS,
            push_backoff: DEFAULT_PUSH_BACKOFF,
            push_backoff_max: DEFAULT_PUSH_BACKOFF_MAX,
            window_id: 1,
        }
    }
}

/// What the loop should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Sleep the regular loop interval.
    Idle,
    /// A transient failure; sleep the retry delay.
    RetryLater,
    /// Run the next step right away.
    Immediate,
}

pub struct Reconciler {
    api: Arc<dyn ManagementApi>,
    control: Arc<dyn SupervisorControl>,
    service: Arc<dyn ProbeService>,
    config_path: PathBuf,
    socket_dir: PathBuf,
    settings: ReconcileSettings,
    previous_nodes: Option<Vec<String>>,
    previous_version: i64,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn ManagementApi>,
        control: Arc<dyn SupervisorControl>,
        service: Arc<dyn ProbeService>,
        config_path: PathBuf,
        socket_dir: PathBuf,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            api,
            control,
            service,
            config_path,
            socket_dir,
            settings,
            previous_nodes: None,
            previous_version: 0,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling `token` interrupts node-list push retries.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn previous_nodes(&self) -> Option<&[String]> {
        self.previous_nodes.as_deref()
    }

    pub fn previous_version(&self) -> i64 {
        self.previous_version
    }

    /// Loops until quit. Only fatal failures return an error.
    pub async fn run(&mut self, signals: &LifecycleSignals) -> Result<()> {
        loop {
            if signals.quit_requested() || self.shutdown.is_cancelled() {
                tracing::info!("quit requested; controller stops");
                return Ok(());
            }

            let delay = match self.step(Utc::now().timestamp()).await? {
                StepOutcome::Idle => self.settings.loop_interval,
                StepOutcome::RetryLater => self.settings.retry_delay,
                StepOutcome::Immediate => continue,
            };

            if signals.sleep_or_quit(delay).await {
                tracing::info!("quit requested; controller stops");
                return Ok(());
            }
        }
    }

    /// One reconciliation pass at Unix time `now`.
    pub async fn step(&mut self, now: i64) -> Result<StepOutcome> {
        self.sync_nodes().await?;
        if self.shutdown.is_cancelled() {
            return Ok(StepOutcome::Idle);
        }

        let window = match self.api.activation_window(self.settings.window_id).await {
            Ok(window) => window,
            Err(err) if err.is_auth() => {
                return Err(err).context("management API refused the activation window query")
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    retry_in = ?self.settings.retry_delay,
                    "cannot fetch activation window"
                );
                return Ok(StepOutcome::RetryLater);
            }
        };

        let active = window.is_active(now);
        let running = self.control.is_running();
        if active && !running {
            tracing::info!(start = window.start, end = window.end, "test window active; starting supervisor");
            if let Err(err) = self.control.start().await {
                tracing::warn!(error = %format!("{err:#}"), "cannot start supervisor");
            }
        } else if !active && running {
            tracing::info!("test window no longer active; stopping supervisor");
            if let Err(err) = self.control.stop().await {
                tracing::warn!(
                    error = %format!("{err:#}"),
                    retry_in = ?self.settings.retry_delay,
                    "cannot stop supervisor"
                );
                return Ok(StepOutcome::RetryLater);
            }
            return Ok(StepOutcome::Immediate);
        }

        if active && window.updated_at > self.previous_version {
            tracing::info!(
                updated_at = window.updated_at,
                previous = self.previous_version,
                "configuration changed upstream; reloading"
            );
            match self.refresh_configuration().await {
                Ok(()) => self.previous_version = window.updated_at,
                Err(err) if is_auth(&err) => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        error = %format!("{err:#}"),
                        retry_in = ?self.settings.retry_delay,
                        "configuration reload failed"
                    );
                    return Ok(StepOutcome::RetryLater);
                }
            }
        }

        Ok(StepOutcome::Idle)
    }

    async fn sync_nodes(&mut self) -> Result<()> {
        let nodes = match enumerate_nodes(self.service.as_ref(), &self.socket_dir).await {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "cannot enumerate probe nodes");
                return Ok(());
            }
        };

        if self.previous_nodes.as_ref() == Some(&nodes) {
            return Ok(());
        }

        let previous: BTreeSet<&String> = self.previous_nodes.iter().flatten().collect();
        let current: BTreeSet<&String> = nodes.iter().collect();
        let added: Vec<&&String> = current.difference(&previous).collect();
        let removed: Vec<&&String> = previous.difference(&current).collect();
        tracing::info!(
            count = nodes.len(),
            added = ?added,
            removed = ?removed,
            "node list changed; pushing to management API"
        );

        let api = self.api.clone();
        let policy = RetryPolicy::new(
            self.settings.push_backoff,
            self.settings.push_backoff_max,
            self.settings.push_attempts,
        );
        let pushed = retry(
            policy,
            &self.shutdown,
            |_| {
                let api = api.clone();
                let nodes = nodes.clone();
                async move { api.put_nodelist(&nodes).await }
            },
            |err: &ApiError| {
                if err.is_auth() {
                    RetryDisposition::Abort
                } else {
                    RetryDisposition::Retry
                }
            },
            |attempt, delay, err, will_retry| {
                tracing::warn!(
                    attempt,
                    delay = ?delay,
                    will_retry,
                    error = %err,
                    "node list push failed"
                );
            },
        )
        .await;

        match pushed {
            Ok(()) => {
                self.previous_nodes = Some(nodes);
                Ok(())
            }
            Err(err) if err.is_cancelled() => {
                tracing::info!(error = %err, "node list push interrupted by shutdown");
                Ok(())
            }
            Err(err) => Err(err).context("cannot push node list to management API"),
        }
    }

    async fn refresh_configuration(&self) -> Result<()> {
        let types = self
            .api
            .measurement_types()
            .await
            .context("failed to fetch measurement types")?;
        let targets = self.api.targets().await.context("failed to fetch targets")?;
        let nodelists = self
            .api
            .nodelists()
            .await
            .context("failed to fetch nodelists")?;

        let (mut config, located) = FleetConfig::load(&self.config_path)?;
        config.measurements = assemble_measurements(&types, &targets, &nodelists);
        config.validate()?;
        config.save(&located)?;
        tracing::info!(
            path = %located.display(),
            series = config.measurements.len(),
            "configuration written"
        );

        self.control.reload()
    }
}

fn is_auth(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ApiError>())
        .any(ApiError::is_auth)
}
