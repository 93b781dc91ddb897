use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::support::{
    helpers::{init_tracing, write_config},
    mock_api::{MockApiServer, MockFleet, LOGIN, PASSWORD},
};
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use probefleet::controller::{
    ApiError, HttpManagementClient, ManagementApi, ReconcileSettings, Reconciler, StepOutcome,
    SupervisorControl,
};
use probefleet::probe::local::{LocalProbeService, DEFAULT_PING_PORT};
use probefleet::probe::{ProbeError, ProbeFuture, ProbeService, ProbeSession};
use probefleet::FleetConfig;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const NOW: i64 = 1_700_000_000;

/// Node directory whose contents the test can change between steps.
#[derive(Clone, Default)]
struct Inventory(Arc<Mutex<Vec<String>>>);

impl Inventory {
    fn set(&self, nodes: &[&str]) {
        *self.0.lock().expect("inventory poisoned") =
            nodes.iter().map(|node| node.to_string()).collect();
    }
}

impl ProbeService for Inventory {
    fn open_session(&self) -> ProbeFuture<'_, Box<dyn ProbeSession>> {
        async { Err(ProbeError::Unsupported("sessions")) }.boxed()
    }

    fn list_directory(&self) -> ProbeFuture<'_, Vec<String>> {
        let nodes = self.0.lock().expect("inventory poisoned").clone();
        async move { Ok(nodes) }.boxed()
    }
}

#[derive(Default)]
struct FakeControl {
    running: AtomicBool,
    refuse_stop: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    reloads: AtomicUsize,
}

impl SupervisorControl for FakeControl {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.refuse_stop.load(Ordering::SeqCst) {
            return async { Err(anyhow::anyhow!("failed to signal supervisor: EPERM")) }.boxed();
        }
        self.running.store(false, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }

    fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    server: MockApiServer,
    fleet: MockFleet,
    inventory: Inventory,
    control: Arc<FakeControl>,
    reconciler: Reconciler,
    shutdown: CancellationToken,
    config: PathBuf,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    harness_with_push_backoff(Duration::from_millis(10)).await
}

async fn harness_with_push_backoff(push_backoff: Duration) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), "  {}\n").expect("config written");
    let fleet = MockFleet::new();
    let server = MockApiServer::start(fleet.clone())
        .await
        .expect("mock API starts");

    let client = HttpManagementClient::new(server.url()).expect("client builds");
    client
        .authenticate(LOGIN, PASSWORD)
        .await
        .expect("credentials accepted");

    let inventory = Inventory::default();
    inventory.set(&["ams-nl.ark", "bos-us.ark"]);
    let control = Arc::new(FakeControl::default());
    let shutdown = CancellationToken::new();
    let reconciler = Reconciler::new(
        Arc::new(client),
        control.clone(),
        Arc::new(inventory.clone()),
        config.clone(),
        dir.path().to_path_buf(),
        ReconcileSettings {
            push_backoff,
            push_backoff_max: push_backoff * 2,
            ..ReconcileSettings::default()
        },
    )
    .with_shutdown(shutdown.clone());

    Harness {
        server,
        fleet,
        inventory,
        control,
        reconciler,
        shutdown,
        config,
        _dir: dir,
    }
}

fn publish_ping_campaign(fleet: &MockFleet) {
    fleet.set_resources(
        json!([{"id": 1, "name": "ping", "nodelist_id": 7}]),
        json!([
            {"target": "192.0.2.1", "ipv": 4, "measurement_type_id": 1, "party": "partyA", "enabled": 1},
            {"target": "192.0.2.2", "ipv": "4", "measurement_type_id": 1, "party": "partyB", "enabled": 0}
        ]),
        json!([{"id": 7, "list": ["ams-nl.ark"]}]),
    );
}

fn measurements(path: &Path) -> FleetConfig {
    FleetConfig::load(path).expect("config reloads").0
}

#[tokio::test]
async fn rejected_credentials_fail_authentication() {
    init_tracing();
    let server = MockApiServer::start(MockFleet::new())
        .await
        .expect("mock API starts");
    let client = HttpManagementClient::new(server.url()).expect("client builds");

    let err = client
        .authenticate(LOGIN, "wrong")
        .await
        .expect_err("bad password is refused");
    assert!(matches!(err, ApiError::Auth { status: 401, .. }), "{err}");
    server.shutdown().await;
}

#[tokio::test]
async fn node_list_is_pushed_only_when_it_changes() {
    let mut h = harness().await;

    assert_eq!(h.reconciler.step(NOW).await.expect("step"), StepOutcome::Idle);
    assert_eq!(h.reconciler.step(NOW).await.expect("step"), StepOutcome::Idle);
    assert_eq!(
        h.fleet.pushed_nodelists(),
        vec![vec!["ams-nl.ark".to_string(), "bos-us.ark".to_string()]]
    );

    h.inventory.set(&["bos-us.ark", "cdg-fr.ark", "ams-nl.ark"]);
    h.reconciler.step(NOW).await.expect("step");
    h.reconciler.step(NOW).await.expect("step");

    let pushes = h.fleet.pushed_nodelists();
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[1], vec!["ams-nl.ark", "bos-us.ark", "cdg-fr.ark"]);
    assert_eq!(
        h.reconciler.previous_nodes(),
        Some(&pushes[1][..]),
        "enumeration is sorted before comparing"
    );
    assert_eq!(h.control.starts.load(Ordering::SeqCst), 0, "window inactive");
    h.server.shutdown().await;
}

#[tokio::test]
async fn agent_sockets_are_enumerated_without_a_directory() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), "  {}\n").expect("config written");
    let sockets = dir.path().join("sockets");
    std::fs::create_dir(&sockets).expect("socket dir");
    for file in ["bos-us.ark-0007", "ams-nl.ark-0001", "ams-nl.ark-0002", "notes.txt"] {
        std::fs::write(sockets.join(file), b"").expect("socket placeholder");
    }

    let fleet = MockFleet::new();
    let server = MockApiServer::start(fleet.clone())
        .await
        .expect("mock API starts");
    let client = HttpManagementClient::new(server.url()).expect("client builds");
    client
        .authenticate(LOGIN, PASSWORD)
        .await
        .expect("credentials accepted");

    let mut reconciler = Reconciler::new(
        Arc::new(client),
        Arc::new(FakeControl::default()),
        Arc::new(LocalProbeService::new(Vec::new(), DEFAULT_PING_PORT)),
        config,
        sockets,
        ReconcileSettings::default(),
    );

    assert_eq!(reconciler.step(NOW).await.expect("step"), StepOutcome::Idle);
    assert_eq!(
        fleet.pushed_nodelists(),
        vec![vec!["ams-nl.ark".to_string(), "bos-us.ark".to_string()]]
    );
    server.shutdown().await;
}

#[tokio::test]
async fn active_window_starts_supervisor_and_reloads_on_new_version() {
    let mut h = harness().await;
    publish_ping_campaign(&h.fleet);
    h.fleet.set_window(true, NOW - 60, NOW + 3600, 100);

    assert_eq!(h.reconciler.step(NOW).await.expect("step"), StepOutcome::Idle);
    assert_eq!(h.control.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.control.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(h.reconciler.previous_version(), 100);

    let config = measurements(&h.config);
    let ping = &config.measurements["ping4"];
    assert_eq!(ping.nodes, vec!["ams-nl.ark"]);
    assert_eq!(ping.parties["partyA"], vec!["192.0.2.1"]);
    assert!(!ping.parties.contains_key("partyB"), "disabled target dropped");
    assert_eq!(
        config.general.management_api.as_deref(),
        Some("http://127.0.0.1:9"),
        "unrelated sections survive the rewrite"
    );

    h.reconciler.step(NOW + 10).await.expect("step");
    assert_eq!(
        h.control.reloads.load(Ordering::SeqCst),
        1,
        "same version does not reload"
    );
    assert_eq!(h.control.starts.load(Ordering::SeqCst), 1, "already running");

    h.fleet.set_window(true, NOW - 60, NOW + 3600, 200);
    h.reconciler.step(NOW + 20).await.expect("step");
    assert_eq!(h.control.reloads.load(Ordering::SeqCst), 2);
    assert_eq!(h.reconciler.previous_version(), 200);
    h.server.shutdown().await;
}

#[tokio::test]
async fn closed_window_stops_a_running_supervisor() {
    let mut h = harness().await;
    publish_ping_campaign(&h.fleet);
    h.fleet.set_window(true, NOW - 60, NOW + 60, 100);
    h.reconciler.step(NOW).await.expect("step");
    assert!(h.control.is_running());

    assert_eq!(
        h.reconciler.step(NOW + 120).await.expect("step"),
        StepOutcome::Immediate,
        "stopping is followed by an immediate step"
    );
    assert_eq!(h.control.stops.load(Ordering::SeqCst), 1);
    assert!(!h.control.is_running());

    assert_eq!(h.reconciler.step(NOW + 120).await.expect("step"), StepOutcome::Idle);
    assert_eq!(h.control.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.control.starts.load(Ordering::SeqCst), 1);
    h.server.shutdown().await;
}

#[tokio::test]
async fn failed_stop_is_retried_later() {
    let mut h = harness().await;
    publish_ping_campaign(&h.fleet);
    h.fleet.set_window(true, NOW - 60, NOW + 60, 100);
    h.reconciler.step(NOW).await.expect("step");
    assert!(h.control.is_running());

    h.control.refuse_stop.store(true, Ordering::SeqCst);
    assert_eq!(
        h.reconciler
            .step(NOW + 120)
            .await
            .expect("a stop failure does not end the controller"),
        StepOutcome::RetryLater
    );
    assert!(h.control.is_running());

    h.control.refuse_stop.store(false, Ordering::SeqCst);
    assert_eq!(
        h.reconciler.step(NOW + 180).await.expect("step"),
        StepOutcome::Immediate
    );
    assert_eq!(h.control.stops.load(Ordering::SeqCst), 2);
    assert!(!h.control.is_running());
    h.server.shutdown().await;
}

#[tokio::test]
async fn unavailable_window_retries_later() {
    let mut h = harness().await;
    h.fleet.set_window_unavailable(true);

    assert_eq!(
        h.reconciler.step(NOW).await.expect("transient failure is not fatal"),
        StepOutcome::RetryLater
    );
    assert_eq!(h.control.starts.load(Ordering::SeqCst), 0);

    h.fleet.set_window_unavailable(false);
    assert_eq!(h.reconciler.step(NOW).await.expect("step"), StepOutcome::Idle);
    h.server.shutdown().await;
}

#[tokio::test]
async fn shutdown_interrupts_node_list_retries() {
    let mut h = harness_with_push_backoff(Duration::from_secs(60)).await;
    h.fleet.set_window_unavailable(true);
    h.fleet.set_nodelist_unavailable(true);

    let shutdown = h.shutdown.clone();
    let (outcome, _) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(h.reconciler.step(NOW), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown.cancel();
        })
    })
    .await
    .expect("shutdown does not wait out the retry delay");

    assert_eq!(outcome.expect("an interrupted push is not fatal"), StepOutcome::Idle);
    assert_eq!(h.fleet.hits("PUT /v1/nodelists"), 1);
    assert_eq!(h.fleet.hits("GET /v1/ddostests/1"), 0, "nothing else runs after shutdown");
    assert_eq!(h.reconciler.previous_nodes(), None, "the push did not happen");
    h.server.shutdown().await;
}

#[tokio::test]
async fn revoked_token_is_fatal() {
    let mut h = harness().await;
    h.fleet.revoke_token();

    let err = h
        .reconciler
        .step(NOW)
        .await
        .expect_err("authentication failures stop the controller");
    assert!(
        err.chain()
            .filter_map(|cause| cause.downcast_ref::<ApiError>())
            .any(ApiError::is_auth),
        "{err:#}"
    );
    assert_eq!(
        h.fleet.hits("PUT /v1/nodelists"),
        1,
        "authentication failures are not retried"
    );
    h.server.shutdown().await;
}
