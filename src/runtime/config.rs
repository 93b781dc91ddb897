use crate::dispatch::engine::{DispatchSettings, DEFAULT_MAX_POLL_ERRORS, DEFAULT_POLL_TIMEOUT};
use crate::dispatch::state::{ReclaimPolicy, DEFAULT_RECLAIM_ATTEMPTS, DEFAULT_RECLAIM_INTERVAL};
use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_PASS_INTERVAL_SECS: u64 = 20;
const DEFAULT_IDLE_RETRY_SECS: u64 = 60;
const DEFAULT_DRAIN_GRACE_SECS: u64 = 60;
const DEFAULT_LIVENESS_TICK_SECS: u64 = 1;
const DEFAULT_EPOCH_PAUSE_SECS: u64 = 1;

/// Timing knobs of the supervisor, its workers and their dispatch passes.
///
/// All instances must be constructed via [`RuntimeSettings::builder`] so
/// invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    poll_timeout: Duration,
    reclaim_interval: Duration,
    reclaim_attempts: u32,
    max_poll_errors: u32,
    pass_interval: Duration,
    idle_retry: Duration,
    drain_grace: Duration,
    liveness_tick: Duration,
    epoch_pause: Duration,
    metrics_interval: Duration,
}

impl RuntimeSettings {
    pub fn builder() -> RuntimeSettingsBuilder {
        RuntimeSettingsBuilder::default()
    }

    /// Longest wait for a single probe event before the pass starts draining.
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn reclaim_interval(&self) -> Duration {
        self.reclaim_interval
    }

    pub fn reclaim_attempts(&self) -> u32 {
        self.reclaim_attempts
    }

    pub fn max_poll_errors(&self) -> u32 {
        self.max_poll_errors
    }

    /// Pause between two passes of the same worker.
    pub fn pass_interval(&self) -> Duration {
        self.pass_interval
    }

    /// Wait before retrying an epoch that could not start any worker.
    pub fn idle_retry(&self) -> Duration {
        self.idle_retry
    }

    /// Time workers get to finish after the epoch token is cancelled.
    pub fn drain_grace(&self) -> Duration {
        self.drain_grace
    }

    pub fn liveness_tick(&self) -> Duration {
        self.liveness_tick
    }

    pub fn epoch_pause(&self) -> Duration {
        self.epoch_pause
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn dispatch(&self) -> DispatchSettings {
        DispatchSettings {
            poll_timeout: self.poll_timeout,
            reclaim: ReclaimPolicy {
                max_iterations: self.reclaim_attempts,
                interval: self.reclaim_interval,
            },
            max_poll_errors: self.max_poll_errors,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            bail!("poll_timeout must be greater than 0");
        }

        if self.reclaim_interval.is_zero() {
            bail!("reclaim_interval must be greater than 0");
        }

        if self.reclaim_attempts == 0 {
            bail!("reclaim_attempts must be greater than 0");
        }

        if self.max_poll_errors == 0 {
            bail!("max_poll_errors must be greater than 0");
        }

        if self.liveness_tick.is_zero() {
            bail!("liveness_tick must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.drain_grace < self.liveness_tick {
            bail!(
                "drain_grace ({:?}) must be at least one liveness_tick ({:?})",
                self.drain_grace,
                self.liveness_tick
            );
        }

        Ok(())
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            reclaim_attempts: DEFAULT_RECLAIM_ATTEMPTS,
            max_poll_errors: DEFAULT_MAX_POLL_ERRORS,
            pass_interval: Duration::from_secs(DEFAULT_PASS_INTERVAL_SECS),
            idle_retry: Duration::from_secs(DEFAULT_IDLE_RETRY_SECS),
            drain_grace: Duration::from_secs(DEFAULT_DRAIN_GRACE_SECS),
            liveness_tick: Duration::from_secs(DEFAULT_LIVENESS_TICK_SECS),
            epoch_pause: Duration::from_secs(DEFAULT_EPOCH_PAUSE_SECS),
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RuntimeSettingsBuilder {
    poll_timeout: Option<Duration>,
    reclaim_interval: Option<Duration>,
    reclaim_attempts: Option<u32>,
    max_poll_errors: Option<u32>,
    pass_interval: Option<Duration>,
    idle_retry: Option<Duration>,
    drain_grace: Option<Duration>,
    liveness_tick: Option<Duration>,
    epoch_pause: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl RuntimeSettingsBuilder {
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = Some(interval);
        self
    }

    pub fn reclaim_attempts(mut self, attempts: u32) -> Self {
        self.reclaim_attempts = Some(attempts);
        self
    }

    pub fn max_poll_errors(mut self, errors: u32) -> Self {
        self.max_poll_errors = Some(errors);
        self
    }

    pub fn pass_interval(mut self, interval: Duration) -> Self {
        self.pass_interval = Some(interval);
        self
    }

    pub fn idle_retry(mut self, delay: Duration) -> Self {
        self.idle_retry = Some(delay);
        self
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = Some(grace);
        self
    }

    pub fn liveness_tick(mut self, tick: Duration) -> Self {
        self.liveness_tick = Some(tick);
        self
    }

    pub fn epoch_pause(mut self, pause: Duration) -> Self {
        self.epoch_pause = Some(pause);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<RuntimeSettings> {
        let defaults = RuntimeSettings::default();
        let settings = RuntimeSettings {
            poll_timeout: self.poll_timeout.unwrap_or(defaults.poll_timeout),
            reclaim_interval: self.reclaim_interval.unwrap_or(defaults.reclaim_interval),
            reclaim_attempts: self.reclaim_attempts.unwrap_or(defaults.reclaim_attempts),
            max_poll_errors: self.max_poll_errors.unwrap_or(defaults.max_poll_errors),
            pass_interval: self.pass_interval.unwrap_or(defaults.pass_interval),
            idle_retry: self.idle_retry.unwrap_or(defaults.idle_retry),
            drain_grace: self.drain_grace.unwrap_or(defaults.drain_grace),
            liveness_tick: self.liveness_tick.unwrap_or(defaults.liveness_tick),
            epoch_pause: self.epoch_pause.unwrap_or(defaults.epoch_pause),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
        };

        settings.validate()?;
        Ok(settings)
    }
}
