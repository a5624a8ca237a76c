use std::time::Duration;

use broker_proxy::framework::mock::{Fault, Journal, MockSubsystems, Stage};
use broker_proxy::framework::Network;
use broker_proxy::{Config, Error, Service};

const BACKENDS: [&str; 3] = ["producer", "consumer", "admin"];

fn unix_only() -> Config {
    Config::builder().unix_addr("/tmp/mock.sock").build().unwrap()
}

fn unix_and_tcp() -> Config {
    Config::builder()
        .unix_addr("/tmp/mock.sock")
        .tcp_addr("127.0.0.1:0")
        .build()
        .unwrap()
}

async fn spawn_err(config: Config, subsystems: MockSubsystems) -> Error {
    match Service::spawn_with(config, subsystems).await {
        Ok(_) => panic!("spawn should have failed"),
        Err(err) => err,
    }
}

fn pos(journal: &Journal, entry: &str) -> usize {
    journal
        .position(entry)
        .unwrap_or_else(|| panic!("{entry:?} missing from {:?}", journal.entries()))
}

/// Every listener quiesced and drained before any backend stop finished.
fn assert_quiesced_before_teardown(journal: &Journal, networks: &[Network]) {
    for backend in BACKENDS {
        let stopped = pos(journal, &format!("stopped {backend}"));
        for network in networks {
            assert!(pos(journal, &format!("quiesce {network}")) < stopped);
            assert!(pos(journal, &format!("drained {network}")) < stopped);
        }
    }
}

// =============================================================================
// CONSTRUCTION AND ROLLBACK
// =============================================================================

#[tokio::test]
async fn test_rollback_stops_everything_started_before_failing_stage() {
    let cases = [
        (Stage::Producer, "producer", 0),
        (Stage::Consumer, "consumer", 1),
        (Stage::Admin, "admin", 2),
        (Stage::UnixListener, "unix listener", 3),
        (Stage::TcpListener, "tcp listener", 3),
    ];
    for (stage, name, started_backends) in cases {
        let subsystems = MockSubsystems::new().fail_at(stage);
        let journal = subsystems.journal();

        let err = spawn_err(unix_and_tcp(), subsystems).await;
        assert!(
            matches!(err, Error::Spawn { subsystem, .. } if subsystem == name),
            "{stage:?}: {err}"
        );

        for (i, backend) in BACKENDS.iter().enumerate() {
            let spawned = journal.contains(&format!("spawned {backend}"));
            let stopped = journal.contains(&format!("stopped {backend}"));
            assert_eq!(spawned, i < started_backends, "{stage:?}: {:?}", journal.entries());
            assert_eq!(stopped, spawned, "{stage:?}: {:?}", journal.entries());
        }
        assert!(!journal.contains("started unix"), "{stage:?}: listeners must never start");
    }
}

#[tokio::test]
async fn test_failed_tcp_listener_drains_unix_listener_first() {
    let subsystems = MockSubsystems::new().fail_at(Stage::TcpListener);
    let journal = subsystems.journal();

    spawn_err(unix_and_tcp(), subsystems).await;

    assert!(journal.contains("bound unix"));
    assert!(!journal.contains("bound tcp"));
    assert_quiesced_before_teardown(&journal, &[Network::Unix]);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_any_spawn() {
    let mut config = unix_only();
    config.channel_buffer_size = 0;
    let subsystems = MockSubsystems::new();
    let journal = subsystems.journal();

    let err = spawn_err(config, subsystems).await;
    assert!(matches!(err, Error::Config(_)));
    assert!(journal.entries().is_empty());
}

// =============================================================================
// SHUTDOWN ORDERING
// =============================================================================

#[tokio::test]
async fn test_unix_only_service_starts_one_listener_and_stops() {
    let subsystems = MockSubsystems::new();
    let journal = subsystems.journal();

    let service = Service::spawn_with(unix_only(), subsystems).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(journal.contains("started unix"));
    assert!(!journal.contains("bound tcp"));
    assert!(!service.is_stopped());

    tokio::time::timeout(Duration::from_secs(5), service.stop())
        .await
        .expect("stop must terminate");
    assert!(service.is_stopped());
    assert_quiesced_before_teardown(&journal, &[Network::Unix]);
}

#[tokio::test]
async fn test_explicit_stop_quiesces_both_listeners_before_backends() {
    let subsystems = MockSubsystems::new();
    let journal = subsystems.journal();

    let service = Service::spawn_with(unix_and_tcp(), subsystems).await.unwrap();
    service.stop().await;

    assert_quiesced_before_teardown(&journal, &[Network::Unix, Network::Tcp]);
}

#[tokio::test]
async fn test_tcp_listener_crash_shuts_down_whole_service() {
    let subsystems = MockSubsystems::new().fault(Network::Tcp, Fault::Crash(Duration::from_millis(30)));
    let journal = subsystems.journal();

    let service = Service::spawn_with(unix_and_tcp(), subsystems).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), service.stopped())
        .await
        .expect("crash must trigger shutdown");

    assert_quiesced_before_teardown(&journal, &[Network::Unix, Network::Tcp]);
}

#[tokio::test]
async fn test_unix_listener_crash_shuts_down_whole_service() {
    let subsystems = MockSubsystems::new().fault(Network::Unix, Fault::Crash(Duration::from_millis(30)));
    let journal = subsystems.journal();

    let service = Service::spawn_with(unix_and_tcp(), subsystems).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), service.stopped())
        .await
        .expect("crash must trigger shutdown");

    assert_quiesced_before_teardown(&journal, &[Network::Unix, Network::Tcp]);
}

#[tokio::test]
async fn test_listener_closing_unexpectedly_shuts_down_service() {
    let subsystems = MockSubsystems::new().fault(Network::Tcp, Fault::Vanish(Duration::from_millis(30)));
    let journal = subsystems.journal();

    let service = Service::spawn_with(unix_and_tcp(), subsystems).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), service.stopped())
        .await
        .expect("closed channel must trigger shutdown");

    assert_quiesced_before_teardown(&journal, &[Network::Unix]);
    for backend in BACKENDS {
        assert!(pos(&journal, "quiesce tcp") < pos(&journal, &format!("stopped {backend}")));
    }
}

// =============================================================================
// DRAINING
// =============================================================================

#[tokio::test]
async fn test_every_drain_failure_is_received_before_teardown() {
    let subsystems = MockSubsystems::new()
        .drain_errors(Network::Unix, 3)
        .drain_errors(Network::Tcp, 2);
    let journal = subsystems.journal();

    let service = Service::spawn_with(unix_and_tcp(), subsystems).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), service.stop())
        .await
        .expect("draining must not block shutdown");

    let first_stop = BACKENDS
        .iter()
        .map(|backend| pos(&journal, &format!("stopped {backend}")))
        .min()
        .unwrap();
    for (network, count) in [("unix", 3), ("tcp", 2)] {
        for i in 0..count {
            assert!(pos(&journal, &format!("drain error {i} {network}")) < first_stop);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_backends_stop_concurrently() {
    let subsystems = MockSubsystems::new().backend_stop_delay(Duration::from_millis(200));
    let service = Service::spawn_with(unix_only(), subsystems).await.unwrap();

    let started = tokio::time::Instant::now();
    service.stop().await;
    assert!(started.elapsed() < Duration::from_millis(400), "{:?}", started.elapsed());
}

// =============================================================================
// STOP SEMANTICS
// =============================================================================

#[tokio::test]
async fn test_concurrent_and_repeated_stop_share_one_shutdown() {
    let subsystems = MockSubsystems::new();
    let journal = subsystems.journal();
    let service = Service::spawn_with(unix_and_tcp(), subsystems).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(service.stop(), service.stop());
    })
    .await
    .expect("concurrent stops must both return");
    service.stop().await;

    for backend in BACKENDS {
        let stops = journal
            .entries()
            .iter()
            .filter(|e| **e == format!("stopped {backend}"))
            .count();
        assert_eq!(stops, 1, "{backend}");
    }
}
