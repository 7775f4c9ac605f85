use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kameo::prelude::{Actor, ActorRef};
use twin_connectivity::client::{
    ClientActor, ClientActorArgs, ClientEnvironment, ClientSnapshot, CloseConnection,
    GetClientSnapshot, OpenConnection, TestConnection,
};
use twin_connectivity::config::ClientConfig;
use twin_connectivity::core::{
    ClientState, Connection, ConnectionFailure, ConnectionLoggerRegistry,
    ConnectionMetricsRegistry, ConnectionType, ConnectivityError, ConnectivityStatus,
};
use twin_connectivity::driver::DriverEvent;
use twin_connectivity::pool::ask_status;
use twin_connectivity::pubsub::{InMemoryBus, MessageBus};
use twin_connectivity::testing::{MockDriver, MockDriverControl, RecordingBus, RecordingObserver};

const CLIENT_ID: &str = "conn-1";

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn connection(status: ConnectivityStatus) -> Arc<Connection> {
    Arc::new(Connection::new(
        CLIENT_ID,
        ConnectionType::Mqtt,
        "tcp://broker.local:1883",
        status,
    ))
}

fn client_config(max_tries: u32) -> ClientConfig {
    ClientConfig {
        connecting_min_timeout: ms(100),
        connecting_max_timeout: ms(400),
        disconnecting_max_timeout: ms(500),
        testing_timeout: ms(2000),
        min_backoff: ms(50),
        max_backoff: ms(100),
        max_tries,
        ..ClientConfig::default()
    }
}

struct Harness {
    actor: ActorRef<ClientActor<MockDriver>>,
    control: Arc<MockDriverControl>,
    observer: Arc<RecordingObserver>,
}

fn spawn_client(
    connection: Arc<Connection>,
    config: ClientConfig,
    dry_run: bool,
) -> Harness {
    spawn_client_on(connection, config, dry_run, Arc::new(InMemoryBus::new()))
}

fn spawn_client_on(
    connection: Arc<Connection>,
    config: ClientConfig,
    dry_run: bool,
    bus: Arc<dyn MessageBus>,
) -> Harness {
    let control = MockDriverControl::new();
    let observer = RecordingObserver::new();
    let env = ClientEnvironment::new(config, bus)
        .with_observer(observer.clone());
    let actor = ClientActor::spawn(ClientActorArgs {
        connection,
        client_id: CLIENT_ID.to_string(),
        driver: MockDriver::new(CLIENT_ID, control.clone()),
        env,
        metrics: ConnectionMetricsRegistry::new(),
        logs: Arc::new(ConnectionLoggerRegistry::new(10, 10)),
        dry_run,
    });
    Harness {
        actor,
        control,
        observer,
    }
}

async fn snapshot(actor: &ActorRef<ClientActor<MockDriver>>) -> ClientSnapshot {
    actor.ask(GetClientSnapshot).await.expect("snapshot")
}

async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(ms(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_reaches_connected_with_open_status() {
    let h = spawn_client(connection(ConnectivityStatus::Open), client_config(5), false);

    let reply = ask_status(&h.actor, OpenConnection::replying).await;
    assert_eq!(reply, Ok("CONNECTED".to_string()));

    let snap = snapshot(&h.actor).await;
    assert_eq!(snap.state, ClientState::Connected);
    assert_eq!(snap.status, ConnectivityStatus::Open);
    assert_eq!(snap.failure_count, 0);
    assert_eq!(
        h.observer.states_of(CLIENT_ID),
        vec![
            ClientState::Initialized,
            ClientState::Connecting,
            ClientState::Connected
        ]
    );
    assert_eq!(h.control.connect_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_then_reopen_cycles_without_restart() {
    let h = spawn_client(connection(ConnectivityStatus::Open), client_config(5), false);
    ask_status(&h.actor, OpenConnection::replying)
        .await
        .expect("open");

    let reply = ask_status(&h.actor, CloseConnection::replying).await;
    assert_eq!(reply, Ok("DISCONNECTED".to_string()));
    let snap = snapshot(&h.actor).await;
    assert_eq!(snap.state, ClientState::Disconnected);
    assert_eq!(snap.status, ConnectivityStatus::Closed);
    assert_eq!(h.control.disconnect_calls(), 1);

    ask_status(&h.actor, OpenConnection::replying)
        .await
        .expect("reopen");
    assert_eq!(snapshot(&h.actor).await.state, ClientState::Connected);
    assert_eq!(h.control.connect_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_failures_stop_children_once() {
    let mut config = client_config(5);
    config.min_backoff = Duration::from_secs(5);
    config.max_backoff = Duration::from_secs(10);
    let h = spawn_client(connection(ConnectivityStatus::Open), config, false);
    ask_status(&h.actor, OpenConnection::replying)
        .await
        .expect("open");

    let failure = || {
        DriverEvent::ConnectionFailure(ConnectionFailure::new(
            ConnectivityError::driver("socket", "reset by peer"),
            "socket reset by peer",
        ))
    };
    assert_eq!(h.control.emit(failure()), 1);
    assert_eq!(h.control.emit(failure()), 1);

    let actor = h.actor.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let actor = actor.clone();
            async move { snapshot(&actor).await.failure_count == 2 }
        })
        .await
    );
    let snap = snapshot(&h.actor).await;
    assert_eq!(snap.state, ClientState::Connecting);
    assert_eq!(snap.status, ConnectivityStatus::Failed);
    assert_eq!(h.control.cleanup_calls(), 2);
    assert_eq!(h.control.child_stops(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_stop_reconnecting() {
    let h = spawn_client(connection(ConnectivityStatus::Open), client_config(1), false);
    h.control.fail_connect(true);

    let reply = ask_status(&h.actor, OpenConnection::replying).await;
    assert!(reply.is_err());

    let actor = h.actor.clone();
    assert!(
        eventually(Duration::from_secs(3), || {
            let actor = actor.clone();
            async move {
                let snap = snapshot(&actor).await;
                snap.state == ClientState::Initialized
            }
        })
        .await
    );
    let snap = snapshot(&h.actor).await;
    assert_eq!(snap.status, ConnectivityStatus::Failed);
    assert!(snap.details.contains("will not try to reconnect"));
    let attempts = h.control.connect_calls();
    assert_eq!(attempts, 2);

    tokio::time::sleep(5 * ms(400)).await;
    assert_eq!(h.control.connect_calls(), attempts);
    assert_eq!(snapshot(&h.actor).await.state, ClientState::Initialized);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dry_run_test_replies_and_stops_instance() {
    let h = spawn_client(connection(ConnectivityStatus::Closed), client_config(5), true);

    let reply = ask_status(&h.actor, TestConnection::replying).await;
    assert_eq!(
        reply,
        Ok("successfully connected + initialized mapper".to_string())
    );
    assert_eq!(h.control.test_calls(), 1);
    tokio::time::timeout(Duration::from_secs(2), h.actor.wait_for_shutdown())
        .await
        .expect("instance stops after test");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_fails_test_without_driver_test() {
    let h = spawn_client(connection(ConnectivityStatus::Closed), client_config(5), true);
    h.control.fail_probe(true);

    let err = ask_status(&h.actor, TestConnection::replying)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectivityError::ConnectionFailed { .. }));
    assert!(err.to_string().contains("broker.local:1883"));
    assert_eq!(h.control.test_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_fails_open_without_connecting() {
    let mut config = client_config(5);
    config.connecting_min_timeout = Duration::from_secs(5);
    config.connecting_max_timeout = Duration::from_secs(10);
    let h = spawn_client(connection(ConnectivityStatus::Open), config, false);
    h.control.fail_probe(true);

    let err = ask_status(&h.actor, OpenConnection::replying)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("broker.local:1883"));
    assert_eq!(h.control.connect_calls(), 0);
    assert_eq!(snapshot(&h.actor).await.status, ConnectivityStatus::Misconfigured);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publisher_failure_skips_consumers_and_subscription() {
    let mut config = client_config(5);
    config.min_backoff = Duration::from_secs(5);
    config.max_backoff = Duration::from_secs(10);
    let bus = RecordingBus::new();
    let h = spawn_client_on(connection(ConnectivityStatus::Open), config, false, bus.clone());
    h.control.fail_publisher(true);

    let reply = ask_status(&h.actor, OpenConnection::replying).await;
    assert!(reply.is_err());
    assert_eq!(h.control.connect_calls(), 1);
    assert_eq!(h.control.consumer_starts(), 0);
    assert!(bus.subscribed().is_empty());
    assert!(bus.declared().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resources_start_in_order_once_connected() {
    let bus = RecordingBus::new();
    let h = spawn_client_on(
        connection(ConnectivityStatus::Open),
        client_config(5),
        false,
        bus.clone(),
    );

    ask_status(&h.actor, OpenConnection::replying)
        .await
        .expect("open");
    assert_eq!(h.control.consumer_starts(), 1);
    assert_eq!(bus.subscribed(), vec![CLIENT_ID.to_string()]);
    assert_eq!(bus.declared(), vec![CLIENT_ID.to_string()]);
    assert!(bus.inner().is_subscribed(CLIENT_ID));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_in_connected_state_is_answered_immediately() {
    let h = spawn_client(connection(ConnectivityStatus::Open), client_config(5), false);
    ask_status(&h.actor, OpenConnection::replying)
        .await
        .expect("open");
    let reply = ask_status(&h.actor, OpenConnection::replying).await;
    assert_eq!(reply, Ok("CONNECTED".to_string()));
    assert_eq!(h.control.connect_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_and_shutdown_stops_instance() {
    let h = spawn_client(connection(ConnectivityStatus::Open), client_config(5), false);
    ask_status(&h.actor, OpenConnection::replying)
        .await
        .expect("open");

    let reply = ask_status(&h.actor, |tx| CloseConnection::replying(tx).and_shutdown()).await;
    assert_eq!(reply, Ok("DISCONNECTED".to_string()));
    tokio::time::timeout(Duration::from_secs(2), h.actor.wait_for_shutdown())
        .await
        .expect("instance stops after close");
    assert_eq!(h.control.disconnect_calls(), 1);
}
