use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use probefleet::probe::{
    Completion, InstanceId, PollEvent, ProbeError, ProbeFuture, ProbeRequest, ProbeService,
    ProbeSession, RawBody, RawResult, RequestBody, TaskId,
};

/// How a scripted node reacts to the dispatch engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBehavior {
    /// Every probe completes right away with this round-trip time.
    Answer { rtt_ms: u64 },
    /// Every probe completes right away without a timing value.
    NoAnswer,
    /// Connecting fails.
    Unreachable,
    /// Probes never complete, but the node finishes once marked done.
    Silent,
    /// Probes never complete and marking done does not help.
    Stuck,
}

#[derive(Default)]
struct Ledger {
    sessions: AtomicUsize,
    refused_sessions: AtomicUsize,
    issued: Mutex<Vec<(String, ProbeRequest)>>,
    halted: Mutex<Vec<TaskId>>,
}

/// Probe service whose nodes follow fixed scripts.
#[derive(Clone)]
pub struct ScriptedService {
    behaviors: Arc<HashMap<String, NodeBehavior>>,
    ledger: Arc<Ledger>,
}

impl ScriptedService {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (S, NodeBehavior)>,
        S: Into<String>,
    {
        Self {
            behaviors: Arc::new(
                nodes
                    .into_iter()
                    .map(|(name, behavior)| (name.into(), behavior))
                    .collect(),
            ),
            ledger: Arc::new(Ledger::default()),
        }
    }

    /// The next `count` session requests fail.
    pub fn refuse_sessions(&self, count: usize) {
        self.ledger.refused_sessions.store(count, Ordering::SeqCst);
    }

    pub fn sessions_opened(&self) -> usize {
        self.ledger.sessions.load(Ordering::SeqCst)
    }

    /// `(node, request)` pairs in issue order.
    pub fn issued(&self) -> Vec<(String, ProbeRequest)> {
        self.ledger.issued.lock().expect("ledger poisoned").clone()
    }

    pub fn halted(&self) -> Vec<TaskId> {
        self.ledger.halted.lock().expect("ledger poisoned").clone()
    }

    pub fn session(&self) -> ScriptedSession {
        self.ledger.sessions.fetch_add(1, Ordering::SeqCst);
        ScriptedSession {
            behaviors: self.behaviors.clone(),
            ledger: self.ledger.clone(),
            instances: Vec::new(),
            events: VecDeque::new(),
            next_task: 0,
        }
    }
}

impl ProbeService for ScriptedService {
    fn open_session(&self) -> ProbeFuture<'_, Box<dyn ProbeSession>> {
        let refused = self
            .ledger
            .refused_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return async { Err(ProbeError::Session("controller socket closed".into())) }.boxed();
        }
        let session: Box<dyn ProbeSession> = Box::new(self.session());
        async move { Ok(session) }.boxed()
    }

    fn list_directory(&self) -> ProbeFuture<'_, Vec<String>> {
        let mut nodes: Vec<String> = self.behaviors.keys().cloned().collect();
        nodes.sort();
        async move { Ok(nodes) }.boxed()
    }
}

struct ScriptedInstance {
    node: String,
    behavior: NodeBehavior,
    in_flight: Option<TaskId>,
    marked_done: bool,
    finished: bool,
}

pub struct ScriptedSession {
    behaviors: Arc<HashMap<String, NodeBehavior>>,
    ledger: Arc<Ledger>,
    instances: Vec<ScriptedInstance>,
    events: VecDeque<PollEvent>,
    next_task: u64,
}

impl ScriptedSession {
    fn instance_mut(&mut self, instance: InstanceId) -> Result<&mut ScriptedInstance, ProbeError> {
        self.instances
            .get_mut(instance.0)
            .ok_or(ProbeError::UnknownInstance(instance))
    }
}

fn reply(node: &str, request: &ProbeRequest, rtt: Option<Duration>) -> RawResult {
    let started_at = rtt.map(|rtt| SystemTime::now() - rtt);
    let body = match &request.body {
        RequestBody::Ping { .. } | RequestBody::TcpSyn { .. } => RawBody::Ping { min_rtt: rtt },
        RequestBody::DnsNs { .. } => RawBody::Dns { rtt },
        RequestBody::HttpGet { url, .. } => RawBody::Http {
            url: url.clone(),
            started_at,
        },
        RequestBody::Udp { .. } => RawBody::Udp { started_at },
    };

    RawResult {
        node: node.to_string(),
        correlation: request.correlation.clone(),
        body,
    }
}

impl ProbeSession for ScriptedSession {
    fn connect<'a>(&'a mut self, node: &'a str) -> ProbeFuture<'a, InstanceId> {
        let behavior = self
            .behaviors
            .get(node)
            .copied()
            .unwrap_or(NodeBehavior::Unreachable);

        let result = if behavior == NodeBehavior::Unreachable {
            Err(ProbeError::AgentConnect {
                node: node.to_string(),
                reason: "scripted refusal".into(),
            })
        } else {
            let instance = InstanceId(self.instances.len());
            self.instances.push(ScriptedInstance {
                node: node.to_string(),
                behavior,
                in_flight: None,
                marked_done: false,
                finished: false,
            });
            self.events.push_back(PollEvent::Ready(instance));
            Ok(instance)
        };

        async move { result }.boxed()
    }

    fn issue(&mut self, instance: InstanceId, request: ProbeRequest) -> Result<TaskId, ProbeError> {
        let task = TaskId(self.next_task);
        let ledger = self.ledger.clone();
        let state = self.instance_mut(instance)?;
        if state.finished || state.marked_done {
            return Err(ProbeError::InstanceClosed(instance));
        }
        if state.in_flight.is_some() {
            return Err(ProbeError::InstanceBusy(instance));
        }

        ledger
            .issued
            .lock()
            .expect("ledger poisoned")
            .push((state.node.clone(), request.clone()));

        let completion = match state.behavior {
            NodeBehavior::Answer { rtt_ms } => {
                Some(reply(&state.node, &request, Some(Duration::from_millis(rtt_ms))))
            }
            NodeBehavior::NoAnswer => Some(reply(&state.node, &request, None)),
            NodeBehavior::Silent | NodeBehavior::Stuck => {
                state.in_flight = Some(task);
                None
            }
            NodeBehavior::Unreachable => None,
        };

        self.next_task += 1;
        if let Some(result) = completion {
            self.events
                .push_back(PollEvent::Completed(Completion { task, result }));
            self.events.push_back(PollEvent::Ready(instance));
        }
        Ok(task)
    }

    fn poll_next(&mut self, timeout: Duration) -> ProbeFuture<'_, PollEvent> {
        async move {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            if self.is_done() {
                return Ok(PollEvent::Done);
            }
            if !timeout.is_zero() {
                tokio::time::sleep(timeout).await;
            }
            Ok(PollEvent::Timeout)
        }
        .boxed()
    }

    fn mark_done(&mut self, instance: InstanceId) {
        if let Ok(state) = self.instance_mut(instance) {
            state.marked_done = true;
            match state.behavior {
                NodeBehavior::Stuck if state.in_flight.is_some() => {}
                _ => {
                    state.in_flight = None;
                    state.finished = true;
                }
            }
        }
    }

    fn force_halt(&mut self, task: TaskId) {
        self.ledger
            .halted
            .lock()
            .expect("ledger poisoned")
            .push(task);
        for state in &mut self.instances {
            if state.in_flight == Some(task) {
                state.in_flight = None;
                state.finished = true;
            }
        }
    }

    fn is_done(&self) -> bool {
        self.instances.iter().all(|state| state.finished)
    }

    fn active_instances(&self) -> Vec<InstanceId> {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, state)| !state.finished)
            .map(|(index, _)| InstanceId(index))
            .collect()
    }
}
