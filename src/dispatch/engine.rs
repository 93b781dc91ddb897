//! One dispatch pass of a measurement job against the probe execution service.

use crate::dispatch::aggregate::{aggregate, AggregatedMetric, ResultRecord};
use crate::dispatch::state::{HaltReason, PassState, ReclaimPolicy, ReclaimStep};
use crate::measure::job::MeasurementJob;
use crate::measure::target::Target;
use crate::probe::service::{
    InstanceId, PollEvent, ProbeService, ProbeSession, RawResult, TaskId,
};
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_POLL_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub poll_timeout: Duration,
    pub reclaim: ReclaimPolicy,
    /// Consecutive poll failures tolerated before the pass starts draining.
    pub max_poll_errors: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            reclaim: ReclaimPolicy::default(),
            max_poll_errors: DEFAULT_MAX_POLL_ERRORS,
        }
    }
}

/// In-flight exchange for one target on one instance.
#[derive(Debug, Clone)]
pub struct ProbeTask {
    pub target: Target,
    pub instance: InstanceId,
    pub issued_at: Instant,
}

/// Outcome of one pass. A halted pass is still a valid result.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub series: String,
    pub metrics: BTreeMap<String, AggregatedMetric>,
    pub halt: HaltReason,
    pub reclaim_iterations: u32,
    pub connected_nodes: usize,
    pub decode_mismatches: usize,
}

impl PassReport {
    pub fn restart_required(&self) -> bool {
        self.halt.restart_required()
    }
}

pub struct DispatchEngine {
    settings: DispatchSettings,
    telemetry: Arc<Telemetry>,
}

impl DispatchEngine {
    pub fn new(settings: DispatchSettings, telemetry: Arc<Telemetry>) -> Self {
        Self {
            settings,
            telemetry,
        }
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// Opens a session and runs one pass of `job` through it.
    pub async fn run_once(
        &self,
        job: &MeasurementJob,
        service: &dyn ProbeService,
        cancel: &CancellationToken,
    ) -> Result<PassReport> {
        let mut session = service
            .open_session()
            .await
            .with_context(|| format!("failed to open probe session for {}", job.series()))?;
        Ok(self.run_session(job, session.as_mut(), cancel).await)
    }

    /// Runs one pass over an already opened session.
    pub async fn run_session(
        &self,
        job: &MeasurementJob,
        session: &mut dyn ProbeSession,
        cancel: &CancellationToken,
    ) -> PassReport {
        let mut pass = Pass::new(job, &self.telemetry, self.settings.reclaim);
        self.telemetry.record_pass();

        pass.connect_all(session, cancel).await;
        if pass.nodes.is_empty() {
            tracing::warn!(
                series = %pass.series,
                "no node could be connected; pass produces no results"
            );
        }

        self.drive(&mut pass, session, cancel).await;
        pass.finish()
    }

    async fn drive(
        &self,
        pass: &mut Pass<'_>,
        session: &mut dyn ProbeSession,
        cancel: &CancellationToken,
    ) {
        let mut poll_errors = 0u32;

        while !pass.state.is_halted() {
            if cancel.is_cancelled() {
                pass.state.cancel();
                break;
            }
            if session.is_done() {
                pass.state.complete();
                break;
            }

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pass.state.cancel();
                    break;
                }
                event = session.poll_next(self.settings.poll_timeout) => event,
            };

            match event {
                Ok(PollEvent::Ready(instance)) => {
                    poll_errors = 0;
                    pass.feed(session, instance);
                }
                Ok(PollEvent::Completed(completion)) => {
                    poll_errors = 0;
                    pass.record_completion(completion.task, completion.result);
                }
                Ok(PollEvent::Done) => pass.state.complete(),
                Ok(PollEvent::Timeout) => {
                    if session.is_done() {
                        pass.state.complete();
                        continue;
                    }
                    tracing::warn!(
                        series = %pass.series,
                        in_flight = pass.in_flight.len(),
                        active_instances = session.active_instances().len(),
                        timeout = ?self.settings.poll_timeout,
                        "probe poll timed out; reclaiming instances"
                    );
                    self.telemetry.record_poll_timeout();
                    pass.state.poll_timed_out();
                    pass.drain(session, cancel).await;
                }
                Err(err) => {
                    poll_errors += 1;
                    tracing::warn!(
                        series = %pass.series,
                        attempt = poll_errors,
                        error = %err,
                        "probe poll failed"
                    );
                    if poll_errors >= self.settings.max_poll_errors {
                        pass.state.poll_timed_out();
                        pass.drain(session, cancel).await;
                    }
                }
            }
        }
    }
}

enum Outcome {
    Completed(SystemTime, RawResult),
    IssueFailed(ResultRecord),
}

struct Pass<'a> {
    job: &'a MeasurementJob,
    telemetry: &'a Telemetry,
    series: String,
    state: PassState,
    nodes: HashMap<InstanceId, String>,
    queues: HashMap<InstanceId, VecDeque<Target>>,
    in_flight: HashMap<TaskId, ProbeTask>,
    outcomes: Vec<Outcome>,
}

impl<'a> Pass<'a> {
    fn new(job: &'a MeasurementJob, telemetry: &'a Telemetry, policy: ReclaimPolicy) -> Self {
        Self {
            job,
            telemetry,
            series: job.series(),
            state: PassState::new(policy),
            nodes: HashMap::new(),
            queues: HashMap::new(),
            in_flight: HashMap::new(),
            outcomes: Vec::new(),
        }
    }

    async fn connect_all(&mut self, session: &mut dyn ProbeSession, cancel: &CancellationToken) {
        for node in self.job.nodes() {
            if cancel.is_cancelled() {
                return;
            }
            match session.connect(node).await {
                Ok(instance) => {
                    self.nodes.insert(instance, node.clone());
                    self.queues
                        .insert(instance, self.job.targets().iter().cloned().collect());
                }
                Err(err) => {
                    tracing::warn!(
                        series = %self.series,
                        node = %node,
                        error = %err,
                        "cannot connect node; dropping it for this pass"
                    );
                }
            }
        }
        tracing::debug!(
            series = %self.series,
            connected = self.nodes.len(),
            configured = self.job.nodes().len(),
            "probe nodes connected"
        );
    }

    /// Hands the next queued target to an idle instance, or marks it done.
    fn feed(&mut self, session: &mut dyn ProbeSession, instance: InstanceId) {
        let node = self.nodes.get(&instance).cloned().unwrap_or_default();
        loop {
            let Some(target) = self
                .queues
                .get_mut(&instance)
                .and_then(VecDeque::pop_front)
            else {
                session.mark_done(instance);
                return;
            };

            let request = self.job.kind().build_request(&target, SystemTime::now());
            match session.issue(instance, request) {
                Ok(task) => {
                    self.telemetry.record_probe_issued();
                    self.in_flight.insert(
                        task,
                        ProbeTask {
                            target,
                            instance,
                            issued_at: Instant::now(),
                        },
                    );
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        series = %self.series,
                        node = %node,
                        target = %target.destination(),
                        error = %err,
                        "failed to issue probe"
                    );
                    self.outcomes.push(Outcome::IssueFailed(ResultRecord::failure(
                        target.destination(),
                        target.party(),
                        &node,
                    )));
                }
            }
        }
    }

    fn record_completion(&mut self, task: TaskId, result: RawResult) {
        if let Some(probe) = self.in_flight.remove(&task) {
            tracing::trace!(
                series = %self.series,
                target = %probe.target.destination(),
                elapsed = ?probe.issued_at.elapsed(),
                "probe completed"
            );
        }
        self.telemetry.record_completion();
        self.outcomes
            .push(Outcome::Completed(SystemTime::now(), result));
    }

    /// Escalating shutdown of instances that stopped responding.
    async fn drain(&mut self, session: &mut dyn ProbeSession, cancel: &CancellationToken) {
        for instance in session.active_instances() {
            session.mark_done(instance);
        }

        loop {
            if cancel.is_cancelled() {
                self.state.cancel();
                return;
            }

            self.collect_ready(session).await;
            let remaining = session.active_instances();

            match self.state.reclaim_tick(remaining.len()) {
                ReclaimStep::Clean => {
                    tracing::info!(
                        series = %self.series,
                        iterations = self.state.reclaim_iterations(),
                        "all probe instances reclaimed"
                    );
                    return;
                }
                ReclaimStep::Exceeded => {
                    let halted = self.in_flight.len();
                    for (task, probe) in self.in_flight.drain() {
                        tracing::warn!(
                            series = %self.series,
                            target = %probe.target.destination(),
                            node = ?self.nodes.get(&probe.instance),
                            "force-halting stuck probe"
                        );
                        session.force_halt(task);
                    }
                    self.telemetry.record_force_halts(halted as u64);
                    tracing::warn!(
                        series = %self.series,
                        remaining = remaining.len(),
                        halted,
                        "instances did not stop in time; restart required"
                    );
                    return;
                }
                ReclaimStep::Continue => {
                    self.telemetry.record_reclaim_iteration();
                    for instance in &remaining {
                        tracing::info!(
                            series = %self.series,
                            node = ?self.nodes.get(instance),
                            iteration = self.state.reclaim_iterations(),
                            "signalling instance to finish"
                        );
                        session.mark_done(*instance);
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.state.cancel();
                            return;
                        }
                        _ = sleep(self.state.policy().interval) => {}
                    }
                }
            }
        }
    }

    /// Picks up events that are already available without waiting.
    async fn collect_ready(&mut self, session: &mut dyn ProbeSession) {
        loop {
            match session.poll_next(Duration::ZERO).await {
                Ok(PollEvent::Completed(completion)) => {
                    self.record_completion(completion.task, completion.result)
                }
                Ok(PollEvent::Ready(instance)) => session.mark_done(instance),
                Ok(PollEvent::Timeout) | Ok(PollEvent::Done) => return,
                Err(err) => {
                    tracing::debug!(series = %self.series, error = %err, "poll failed while draining");
                    return;
                }
            }
        }
    }

    fn finish(self) -> PassReport {
        let halt = self.state.halt_reason().unwrap_or(HaltReason::Completed);
        let kind = self.job.kind();
        let mut mismatches = 0usize;
        let mut records = Vec::with_capacity(self.outcomes.len());

        for outcome in self.outcomes {
            match outcome {
                Outcome::IssueFailed(record) => records.push(record),
                Outcome::Completed(completed_at, raw) => {
                    match kind.decode(completed_at, &raw, self.job) {
                        Ok(record) => records.push(record),
                        Err(err) => {
                            mismatches += 1;
                            self.telemetry.record_decode_mismatch();
                            tracing::warn!(
                                series = %self.series,
                                node = %raw.node,
                                error = %err,
                                "dropping unattributable probe result"
                            );
                        }
                    }
                }
            }
        }

        let metrics = aggregate(records);
        tracing::info!(
            series = %self.series,
            halt = %halt,
            destinations = metrics.len(),
            reclaim_iterations = self.state.reclaim_iterations(),
            "dispatch pass finished"
        );

        PassReport {
            series: self.series,
            metrics,
            halt,
            reclaim_iterations: self.state.reclaim_iterations(),
            connected_nodes: self.nodes.len(),
            decode_mismatches: mismatches,
        }
    }
}
