//! Probe backend that executes every probe from this host.
//!
//! Each connected node is a logical instance with at most one probe in
//! flight. Ping is measured as the time to open a TCP connection (a refused
//! connection still proves the host answered), since ICMP needs raw sockets.

use crate::probe::service::{
    Completion, InstanceId, PollEvent, ProbeError, ProbeFuture, ProbeRequest, ProbeService,
    ProbeSession, RawBody, RawResult, RequestBody, TaskId,
};
use crate::runtime::fleet_config::{NodeDiscovery, ProbeSection};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use url::Url;

pub const DEFAULT_PING_PORT: u16 = 443;
const DNS_PORT: u16 = 53;
const DNS_TYPE_NS: u16 = 2;
const DNS_CLASS_IN: u16 = 1;
const MAX_DATAGRAM: usize = 1500;

#[derive(Debug, Clone)]
pub struct LocalProbeService {
    /// `None` leaves node discovery to the agent socket directory.
    directory: Option<Vec<String>>,
    ping_port: u16,
}

impl LocalProbeService {
    /// Serves `nodes` as its directory. An empty list means the service has no
    /// directory of its own.
    pub fn new(nodes: Vec<String>, ping_port: u16) -> Self {
        Self {
            directory: (!nodes.is_empty()).then_some(nodes),
            ping_port,
        }
    }

    pub fn from_section(section: &ProbeSection) -> Self {
        match section.discovery {
            NodeDiscovery::Directory => Self::new(section.local_nodes.clone(), section.ping_port),
            NodeDiscovery::Sockets => Self::new(Vec::new(), section.ping_port),
        }
    }
}

impl ProbeService for LocalProbeService {
    fn open_session(&self) -> ProbeFuture<'_, Box<dyn ProbeSession>> {
        let session = LocalSession::new(self.ping_port);
        Box::pin(async move { Ok(Box::new(session) as Box<dyn ProbeSession>) })
    }

    fn list_directory(&self) -> ProbeFuture<'_, Vec<String>> {
        let listing = self
            .directory
            .clone()
            .ok_or(ProbeError::Unsupported("directory queries"));
        Box::pin(async move { listing })
    }
}

struct LocalInstance {
    node: String,
    done: bool,
}

struct InFlight {
    instance: InstanceId,
    handle: JoinHandle<()>,
}

struct LocalSession {
    ping_port: u16,
    instances: Vec<LocalInstance>,
    ready: VecDeque<InstanceId>,
    in_flight: HashMap<TaskId, InFlight>,
    next_task: u64,
    events_tx: mpsc::UnboundedSender<Completion>,
    events_rx: mpsc::UnboundedReceiver<Completion>,
}

impl LocalSession {
    fn new(ping_port: u16) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            ping_port,
            instances: Vec::new(),
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            next_task: 0,
            events_tx,
            events_rx,
        }
    }

    fn instance(&self, id: InstanceId) -> Result<&LocalInstance, ProbeError> {
        self.instances
            .get(id.0)
            .ok_or(ProbeError::UnknownInstance(id))
    }

    fn is_busy(&self, id: InstanceId) -> bool {
        self.in_flight.values().any(|flight| flight.instance == id)
    }
}

impl ProbeSession for LocalSession {
    fn connect<'a>(&'a mut self, node: &'a str) -> ProbeFuture<'a, InstanceId> {
        Box::pin(async move {
            if node.trim().is_empty() {
                return Err(ProbeError::AgentConnect {
                    node: node.to_owned(),
                    reason: "empty node name".into(),
                });
            }
            let id = InstanceId(self.instances.len());
            self.instances.push(LocalInstance {
                node: node.to_owned(),
                done: false,
            });
            self.ready.push_back(id);
            Ok(id)
        })
    }

    fn issue(&mut self, instance: InstanceId, request: ProbeRequest) -> Result<TaskId, ProbeError> {
        let node = {
            let entry = self.instance(instance)?;
            if entry.done {
                return Err(ProbeError::InstanceClosed(instance));
            }
            entry.node.clone()
        };
        if self.is_busy(instance) {
            return Err(ProbeError::InstanceBusy(instance));
        }

        let task = TaskId(self.next_task);
        self.next_task += 1;

        let events = self.events_tx.clone();
        let ping_port = self.ping_port;
        let handle = tokio::spawn(async move {
            let body = execute(request.body, ping_port).await;
            let _ = events.send(Completion {
                task,
                result: RawResult {
                    node,
                    correlation: request.correlation,
                    body,
                },
            });
        });

        self.in_flight.insert(task, InFlight { instance, handle });
        Ok(task)
    }

    fn poll_next(&mut self, wait: Duration) -> ProbeFuture<'_, PollEvent> {
        Box::pin(async move {
            if let Some(instance) = self.ready.pop_front() {
                return Ok(PollEvent::Ready(instance));
            }

            let deadline = Instant::now() + wait;
            loop {
                if self.is_done() {
                    return Ok(PollEvent::Done);
                }

                let completion = match timeout_at(deadline, self.events_rx.recv()).await {
                    Err(_) => return Ok(PollEvent::Timeout),
                    Ok(None) => return Err(ProbeError::Session("event channel closed".into())),
                    Ok(Some(completion)) => completion,
                };

                // Completions of force-halted tasks can still arrive; skip them.
                let Some(flight) = self.in_flight.remove(&completion.task) else {
                    continue;
                };
                let finished = self
                    .instances
                    .get(flight.instance.0)
                    .map(|entry| entry.done)
                    .unwrap_or(true);
                if !finished {
                    self.ready.push_back(flight.instance);
                }
                return Ok(PollEvent::Completed(completion));
            }
        })
    }

    fn mark_done(&mut self, instance: InstanceId) {
        if let Some(entry) = self.instances.get_mut(instance.0) {
            entry.done = true;
        }
        self.ready.retain(|queued| *queued != instance);
    }

    fn force_halt(&mut self, task: TaskId) {
        if let Some(flight) = self.in_flight.remove(&task) {
            flight.handle.abort();
        }
    }

    fn is_done(&self) -> bool {
        self.in_flight.is_empty() && self.instances.iter().all(|entry| entry.done)
    }

    fn active_instances(&self) -> Vec<InstanceId> {
        (0..self.instances.len())
            .map(InstanceId)
            .filter(|id| !self.instances[id.0].done || self.is_busy(*id))
            .collect()
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        for (_, flight) in self.in_flight.drain() {
            flight.handle.abort();
        }
    }
}

async fn execute(body: RequestBody, ping_port: u16) -> RawBody {
    match body {
        RequestBody::Ping { dst, wait } => RawBody::Ping {
            min_rtt: tcp_connect_rtt(dst, ping_port, wait).await,
        },
        RequestBody::TcpSyn { dst, port, wait } => RawBody::Ping {
            min_rtt: tcp_connect_rtt(dst, port, wait).await,
        },
        RequestBody::HttpGet { url, dst, limit } => {
            let started = SystemTime::now();
            let answered = http_get(&url, dst, limit).await;
            RawBody::Http {
                url,
                started_at: answered.then_some(started),
            }
        }
        RequestBody::DnsNs {
            server,
            query,
            wait,
        } => RawBody::Dns {
            rtt: dns_ns_rtt(server, &query, wait).await,
        },
        RequestBody::Udp {
            dst,
            port,
            payload,
            wait,
        } => {
            let started = SystemTime::now();
            let answered = udp_exchange(dst, port, &payload, wait, |_| true)
                .await
                .is_some();
            RawBody::Udp {
                started_at: answered.then_some(started),
            }
        }
    }
}

async fn tcp_connect_rtt(dst: IpAddr, port: u16, wait: Duration) -> Option<Duration> {
    let started = Instant::now();
    match timeout(wait, TcpStream::connect((dst, port))).await {
        Ok(Ok(_stream)) => Some(started.elapsed()),
        Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => Some(started.elapsed()),
        Ok(Err(err)) => {
            tracing::debug!(%dst, port, error = %err, "tcp probe failed");
            None
        }
        Err(_) => None,
    }
}

async fn http_get(url: &str, dst: IpAddr, limit: Duration) -> bool {
    let mut builder = reqwest::Client::builder().timeout(limit);
    if let Ok(parsed) = Url::parse(url) {
        if let (Some(host), Some(port)) = (parsed.host_str(), parsed.port_or_known_default()) {
            if host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().is_err() {
                builder = builder.resolve(host, SocketAddr::new(dst, port));
            }
        }
    }

    let client = match builder.build() {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(url, error = %err, "failed to build http probe client");
            return false;
        }
    };

    match client.get(url).send().await {
        Ok(response) => response.bytes().await.is_ok(),
        Err(err) => {
            tracing::debug!(url, error = %err, "http probe failed");
            false
        }
    }
}

async fn dns_ns_rtt(server: IpAddr, query: &str, wait: Duration) -> Option<Duration> {
    let id = query_id();
    let packet = match encode_ns_query(id, query) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::warn!(query, error = %err, "cannot encode dns probe");
            return None;
        }
    };
    let started = Instant::now();
    udp_exchange(server, DNS_PORT, &packet, wait, |reply| {
        reply.len() >= 2 && reply[..2] == id.to_be_bytes()
    })
    .await
    .map(|_| started.elapsed())
}

/// Sends one datagram and waits for the first reply accepted by `accept`.
async fn udp_exchange<F>(
    dst: IpAddr,
    port: u16,
    payload: &[u8],
    wait: Duration,
    accept: F,
) -> Option<usize>
where
    F: Fn(&[u8]) -> bool,
{
    let bind: IpAddr = match dst {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind(SocketAddr::new(bind, 0)).await.ok()?;
    socket.connect((dst, port)).await.ok()?;
    socket.send(payload).await.ok()?;

    let deadline = Instant::now() + wait;
    let mut buffer = [0u8; MAX_DATAGRAM];
    loop {
        match timeout_at(deadline, socket.recv(&mut buffer)).await {
            Ok(Ok(len)) if accept(&buffer[..len]) => return Some(len),
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => {
                tracing::debug!(%dst, port, error = %err, "udp probe failed");
                return None;
            }
            Err(_) => return None,
        }
    }
}

fn query_id() -> u16 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| (since.subsec_nanos() >> 4) as u16)
        .unwrap_or(0x4242)
}

/// Encodes a recursive-desired NS query for `name`.
pub(crate) fn encode_ns_query(id: u16, name: &str) -> Result<Vec<u8>, ProbeError> {
    let invalid = |reason: &str| {
        ProbeError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid query name `{name}`: {reason}"),
        ))
    };

    let mut packet = Vec::with_capacity(18 + name.len());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]);
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]);

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > 63 {
            return Err(invalid("label longer than 63 bytes"));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&DNS_TYPE_NS.to_be_bytes());
    packet.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
    Ok(packet)
}
