use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::init_tracing,
    scripted::{NodeBehavior, ScriptedService},
};
use probefleet::dispatch::{MeanValue, NodeSample, ReclaimPolicy};
use probefleet::measure::target::TargetDetail;
use probefleet::{
    DispatchEngine, DispatchSettings, HaltReason, IpVersion, MeasurementJob, MeasurementKind,
    Target, Telemetry,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn ping_job(targets: &[(&str, &str)], nodes: &[&str]) -> MeasurementJob {
    let targets = targets
        .iter()
        .enumerate()
        .map(|(index, (destination, party))| {
            let address: IpAddr = destination
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 200)));
            Target::new(*destination, *party, address, index, TargetDetail::Host)
        })
        .collect();
    MeasurementJob::new(
        MeasurementKind::Ping,
        IpVersion::V4,
        targets,
        nodes.iter().map(|node| node.to_string()).collect(),
    )
    .expect("job has targets and nodes")
}

fn engine(telemetry: &Arc<Telemetry>) -> DispatchEngine {
    DispatchEngine::new(
        DispatchSettings {
            poll_timeout: Duration::from_secs(15),
            reclaim: ReclaimPolicy {
                max_iterations: 10,
                interval: Duration::from_secs(1),
            },
            max_poll_errors: 3,
        },
        telemetry.clone(),
    )
}

#[tokio::test(start_paused = true)]
async fn clean_pass_aggregates_one_node() {
    init_tracing();
    let telemetry = Arc::new(Telemetry::default());
    let service = ScriptedService::new([("nodeX", NodeBehavior::Answer { rtt_ms: 30 })]);
    let job = ping_job(&[("1.2.3.4", "partyA")], &["nodeX"]);

    let report = engine(&telemetry)
        .run_once(&job, &service, &CancellationToken::new())
        .await
        .expect("session opens");

    assert_eq!(report.series, "ping4");
    assert_eq!(report.halt, HaltReason::Completed);
    assert!(!report.restart_required());
    assert_eq!(report.connected_nodes, 1);

    let metric = &report.metrics["1.2.3.4"];
    assert_eq!(metric.party, "partyA");
    assert_eq!(
        metric.per_node,
        vec![NodeSample {
            node: "nodeX".into(),
            count: 1,
            value_ms: 30,
        }]
    );
    assert_eq!(
        metric.mean,
        MeanValue {
            count: 1,
            value_ms: 30
        }
    );

    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.passes, 1);
    assert_eq!(snapshot.probes_issued, 1);
    assert_eq!(snapshot.completions, 1);
    assert_eq!(snapshot.poll_timeouts, 0);
}

#[tokio::test(start_paused = true)]
async fn every_target_is_probed_from_every_connected_node() {
    init_tracing();
    let telemetry = Arc::new(Telemetry::default());
    let service = ScriptedService::new([
        ("nodeX", NodeBehavior::Answer { rtt_ms: 30 }),
        ("nodeY", NodeBehavior::Answer { rtt_ms: 41 }),
        ("nodeZ", NodeBehavior::NoAnswer),
        ("down", NodeBehavior::Unreachable),
    ]);
    let job = ping_job(
        &[("192.0.2.1", "partyA"), ("192.0.2.2", "partyB")],
        &["nodeX", "nodeY", "nodeZ", "down"],
    );

    let report = engine(&telemetry)
        .run_once(&job, &service, &CancellationToken::new())
        .await
        .expect("session opens");

    assert_eq!(report.halt, HaltReason::Completed);
    assert_eq!(report.connected_nodes, 3, "unreachable node is dropped");
    assert_eq!(service.issued().len(), 6);

    for destination in ["192.0.2.1", "192.0.2.2"] {
        let metric = &report.metrics[destination];
        let mut nodes: Vec<&str> = metric.per_node.iter().map(|s| s.node.as_str()).collect();
        nodes.sort();
        assert_eq!(nodes, vec!["nodeX", "nodeY", "nodeZ"]);

        let silent = metric
            .per_node
            .iter()
            .find(|sample| sample.node == "nodeZ")
            .expect("nodeZ sample present");
        assert_eq!((silent.count, silent.value_ms), (0, 0));

        // (30 + 41) / 2 = 35.5 rounds to the even neighbour.
        assert_eq!(
            metric.mean,
            MeanValue {
                count: 2,
                value_ms: 36
            }
        );
    }
    assert_eq!(report.metrics["192.0.2.2"].party, "partyB");
}

#[tokio::test(start_paused = true)]
async fn silent_node_is_reclaimed_and_answers_are_kept() {
    init_tracing();
    let telemetry = Arc::new(Telemetry::default());
    let service = ScriptedService::new([
        ("nodeX", NodeBehavior::Answer { rtt_ms: 12 }),
        ("quiet", NodeBehavior::Silent),
    ]);
    let job = ping_job(&[("192.0.2.1", "partyA")], &["nodeX", "quiet"]);

    let report = engine(&telemetry)
        .run_once(&job, &service, &CancellationToken::new())
        .await
        .expect("session opens");

    assert_eq!(report.halt, HaltReason::Reclaimed);
    assert!(!report.restart_required());
    assert!(service.halted().is_empty());

    let metric = &report.metrics["192.0.2.1"];
    assert_eq!(metric.per_node.len(), 1);
    assert_eq!(metric.per_node[0].node, "nodeX");
    assert_eq!(metric.mean.value_ms, 12);

    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.poll_timeouts, 1);
    assert_eq!(snapshot.force_halts, 0);
}

#[tokio::test(start_paused = true)]
async fn stuck_node_exhausts_reclaim_and_requires_restart() {
    init_tracing();
    let telemetry = Arc::new(Telemetry::default());
    let service = ScriptedService::new([("wedged", NodeBehavior::Stuck)]);
    let job = ping_job(&[("192.0.2.1", "partyA")], &["wedged"]);

    let started = tokio::time::Instant::now();
    let report = engine(&telemetry)
        .run_once(&job, &service, &CancellationToken::new())
        .await
        .expect("session opens");

    assert_eq!(report.halt, HaltReason::ReclaimExceeded);
    assert!(report.restart_required());
    assert_eq!(report.reclaim_iterations, 10);
    assert!(report.metrics.is_empty());
    assert_eq!(service.halted().len(), 1, "in-flight probe is force-halted");
    assert!(
        started.elapsed() >= Duration::from_secs(15 + 10),
        "one poll timeout plus ten reclaim intervals"
    );

    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.reclaim_iterations, 10);
    assert_eq!(snapshot.force_halts, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_pending_poll() {
    init_tracing();
    let telemetry = Arc::new(Telemetry::default());
    let service = ScriptedService::new([("quiet", NodeBehavior::Silent)]);
    let job = ping_job(&[("192.0.2.1", "partyA")], &["quiet"]);
    let cancel = CancellationToken::new();
    let engine = engine(&telemetry);

    let started = tokio::time::Instant::now();
    let (report, _) = tokio::join!(engine.run_once(&job, &service, &cancel), async {
        sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });
    let report = report.expect("session opens");

    assert_eq!(report.halt, HaltReason::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(telemetry.snapshot().poll_timeouts, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_connects_nothing() {
    init_tracing();
    let telemetry = Arc::new(Telemetry::default());
    let service = ScriptedService::new([("nodeX", NodeBehavior::Answer { rtt_ms: 5 })]);
    let job = ping_job(&[("192.0.2.1", "partyA")], &["nodeX"]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = engine(&telemetry)
        .run_once(&job, &service, &cancel)
        .await
        .expect("session opens");

    assert_eq!(report.halt, HaltReason::Cancelled);
    assert_eq!(report.connected_nodes, 0);
    assert!(service.issued().is_empty());
}
