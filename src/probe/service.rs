use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};
use thiserror::Error;

pub type ProbeFuture<'a, T> = BoxFuture<'a, Result<T, ProbeError>>;

/// Session-scoped handle of one connected remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub usize);

/// Session-scoped handle of one issued probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to connect to probe node {node}: {reason}")]
    AgentConnect { node: String, reason: String },
    #[error("{0} is not connected to this session")]
    UnknownInstance(InstanceId),
    #[error("{0} no longer accepts work")]
    InstanceClosed(InstanceId),
    #[error("{0} already has a probe in flight")]
    InstanceBusy(InstanceId),
    #[error("probe session failed: {0}")]
    Session(String),
    #[error("probe service does not support {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Data echoed back with a result so it can be mapped to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub lookup_index: usize,
    pub query_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub correlation: Correlation,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// Echo-style reachability probe.
    Ping { dst: IpAddr, wait: Duration },
    /// Connection-opening probe against a TCP port.
    TcpSyn {
        dst: IpAddr,
        port: u16,
        wait: Duration,
    },
    HttpGet {
        url: String,
        dst: IpAddr,
        limit: Duration,
    },
    /// NS query for `query` sent to `server`.
    DnsNs {
        server: IpAddr,
        query: String,
        wait: Duration,
    },
    Udp {
        dst: IpAddr,
        port: u16,
        payload: Vec<u8>,
        wait: Duration,
    },
}

/// Result shape reported by an agent. Timing fields are absent when the
/// probe got no answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResult {
    pub node: String,
    pub correlation: Correlation,
    pub body: RawBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawBody {
    Ping {
        min_rtt: Option<Duration>,
    },
    Http {
        url: String,
        started_at: Option<SystemTime>,
    },
    Dns {
        rtt: Option<Duration>,
    },
    Udp {
        started_at: Option<SystemTime>,
    },
}

impl RawBody {
    pub fn label(&self) -> &'static str {
        match self {
            RawBody::Ping { .. } => "ping",
            RawBody::Http { .. } => "http",
            RawBody::Dns { .. } => "dns",
            RawBody::Udp { .. } => "udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub task: TaskId,
    pub result: RawResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// The instance is idle and wants more work.
    Ready(InstanceId),
    Completed(Completion),
    /// The bounded wait elapsed without any event.
    Timeout,
    /// Every instance has finished.
    Done,
}

/// Entry point into the probe execution service.
pub trait ProbeService: Send + Sync {
    fn open_session(&self) -> ProbeFuture<'_, Box<dyn ProbeSession>>;

    /// Names of the agents currently reachable through the service.
    fn list_directory(&self) -> ProbeFuture<'_, Vec<String>> {
        Box::pin(async { Err(ProbeError::Unsupported("directory queries")) })
    }
}

/// One feed/collect session against a set of connected agents.
///
/// `issue` never blocks; the only suspension point is `poll_next`.
pub trait ProbeSession: Send {
    fn connect<'a>(&'a mut self, node: &'a str) -> ProbeFuture<'a, InstanceId>;

    fn issue(&mut self, instance: InstanceId, request: ProbeRequest) -> Result<TaskId, ProbeError>;

    fn poll_next(&mut self, timeout: Duration) -> ProbeFuture<'_, PollEvent>;

    /// Tells the agent no more work follows; it finishes once in-flight probes end.
    fn mark_done(&mut self, instance: InstanceId);

    fn force_halt(&mut self, task: TaskId);

    fn is_done(&self) -> bool;

    /// Instances that still have work in flight or were never marked done.
    fn active_instances(&self) -> Vec<InstanceId>;
}
