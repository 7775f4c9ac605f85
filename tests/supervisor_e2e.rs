use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kameo::prelude::{Actor, ActorRef};
use twin_connectivity::config::{ClientConfig, ConnectivityConfig};
use twin_connectivity::core::{
    ClientState, CommandHeaders, Connection, ConnectionLogs, ConnectionMetrics, ConnectionType,
    ConnectivityError, ConnectivityResult, ConnectivityStatus,
};
use twin_connectivity::pubsub::InMemoryBus;
use twin_connectivity::supervisor::{
    ConnectionSupervisor, ConnectivityCommand, ConnectivityEvent, ConnectivityResponse,
    GetSupervisorSnapshot, InMemoryJournal, Lifecycle, SupervisorArgs, SupervisorSnapshot,
    execute,
};
use twin_connectivity::testing::{
    MockDriverControl, MockDriverFactory, RecordingObserver, StaticPriorityProvider,
};

const ID: &str = "conn-1";

type Supervisor = ActorRef<ConnectionSupervisor<MockDriverFactory>>;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn connection(status: ConnectivityStatus) -> Connection {
    Connection::new(ID, ConnectionType::Amqp10, "amqp://broker.local:5672", status)
}

fn config() -> ConnectivityConfig {
    let mut config = ConnectivityConfig {
        client: ClientConfig {
            connecting_min_timeout: ms(500),
            connecting_max_timeout: ms(2000),
            disconnecting_max_timeout: ms(500),
            testing_timeout: ms(2000),
            min_backoff: ms(50),
            max_backoff: ms(200),
            ..ClientConfig::default()
        },
        ..ConnectivityConfig::default()
    };
    config.supervisor.client_actor_ask_timeout = Duration::from_secs(3);
    config
}

struct Fixture {
    journal: Arc<InMemoryJournal>,
    factory: Arc<MockDriverFactory>,
    observer: Arc<RecordingObserver>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            journal: InMemoryJournal::new(),
            factory: MockDriverFactory::new(MockDriverControl::new()),
            observer: RecordingObserver::new(),
        }
    }

    fn control(&self) -> &Arc<MockDriverControl> {
        self.factory.control()
    }

    fn args(&self) -> SupervisorArgs<MockDriverFactory> {
        SupervisorArgs::new(
            ID,
            self.factory.clone(),
            self.journal.clone(),
            Arc::new(InMemoryBus::new()),
        )
        .with_config(config())
        .with_observer(self.observer.clone())
    }

    fn spawn(&self) -> Supervisor {
        ConnectionSupervisor::spawn(self.args())
    }

    fn events(&self) -> Vec<&'static str> {
        self.journal
            .entries_of(ID)
            .iter()
            .map(|entry| entry.event.name())
            .collect()
    }
}

async fn run(
    supervisor: &Supervisor,
    command: ConnectivityCommand,
) -> ConnectivityResult<ConnectivityResponse> {
    execute(supervisor, command, CommandHeaders::with_timeout(Duration::from_secs(5))).await
}

async fn snapshot(supervisor: &Supervisor) -> SupervisorSnapshot {
    supervisor
        .ask(GetSupervisorSnapshot)
        .await
        .expect("supervisor snapshot")
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

fn empty_events(journal: &InMemoryJournal) -> usize {
    journal
        .entries_of(ID)
        .iter()
        .filter(|e| matches!(e.event, ConnectivityEvent::Empty { .. }))
        .count()
}

async fn shut_down(supervisor: &Supervisor) {
    let _ = supervisor.stop_gracefully().await;
    tokio::time::timeout(Duration::from_secs(3), supervisor.wait_for_shutdown())
        .await
        .expect("supervisor stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_close_and_reopen_cycle_instance() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();

    let created = run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Open)),
    )
    .await
    .expect("create");
    assert!(matches!(created, ConnectivityResponse::Created(c) if c.id == ID));
    assert_eq!(
        fx.observer.states_of(ID),
        vec![
            ClientState::Initialized,
            ClientState::Connecting,
            ClientState::Connected
        ]
    );
    assert_eq!(snapshot(&supervisor).await.client_ids, vec![ID.to_string()]);

    let closed = run(&supervisor, ConnectivityCommand::Close)
        .await
        .expect("close");
    assert_eq!(closed, ConnectivityResponse::Closed);
    assert!(
        fx.observer
            .states_of(ID)
            .ends_with(&[ClientState::Disconnecting, ClientState::Disconnected])
    );
    let snap = snapshot(&supervisor).await;
    assert!(snap.client_ids.is_empty());
    assert_eq!(
        snap.entity.map(|c| c.connection_status),
        Some(ConnectivityStatus::Closed)
    );

    let opened = run(&supervisor, ConnectivityCommand::Open)
        .await
        .expect("reopen");
    assert_eq!(opened, ConnectivityResponse::Opened);
    assert!(fx.observer.states_of(ID).ends_with(&[
        ClientState::Initialized,
        ClientState::Connecting,
        ClientState::Connected
    ]));
    assert_eq!(fx.control().connect_calls(), 2);

    assert_eq!(
        fx.events(),
        vec!["ConnectionCreated", "ConnectionClosed", "ConnectionOpened"]
    );
    let entries = fx.journal.entries_of(ID);
    assert!(entries[0].tags.contains("always-alive"));
    assert!(entries[0].tags.contains("priority:0"));
    assert!(entries[1].tags.is_empty());
    assert_eq!(snapshot(&supervisor).await.revision, 3);

    shut_down(&supervisor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovery_reopens_connection_desired_open() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Open)),
    )
    .await
    .expect("create");
    shut_down(&supervisor).await;
    assert_eq!(fx.control().connect_calls(), 1);

    let recovered = fx.spawn();
    let control = fx.control().clone();
    assert!(
        eventually(Duration::from_secs(3), || {
            let control = control.clone();
            async move { control.connect_calls() == 2 }
        })
        .await
    );
    let snap = snapshot(&recovered).await;
    assert_eq!(snap.lifecycle, Lifecycle::Created);
    assert_eq!(snap.revision, 1);
    assert_eq!(snap.client_ids.len(), 1);
    assert_eq!(fx.events(), vec!["ConnectionCreated"]);

    shut_down(&recovered).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovery_swallows_open_failures() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Open)),
    )
    .await
    .expect("create");
    shut_down(&supervisor).await;

    fx.factory.fail_create(true);
    let recovered = fx.spawn();
    let response = run(&recovered, ConnectivityCommand::Retrieve)
        .await
        .expect("supervisor keeps serving");
    assert!(matches!(response, ConnectivityResponse::Retrieved(c) if c.id == ID));
    assert!(snapshot(&recovered).await.client_ids.is_empty());

    shut_down(&recovered).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_connection_is_not_accessible() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Open)),
    )
    .await
    .expect("create");

    let deleted = run(&supervisor, ConnectivityCommand::Delete)
        .await
        .expect("delete");
    assert_eq!(deleted, ConnectivityResponse::Deleted);
    tokio::time::timeout(Duration::from_secs(3), supervisor.wait_for_shutdown())
        .await
        .expect("supervisor passivates after delete");

    let respawned = fx.spawn();
    let err = run(&respawned, ConnectivityCommand::Open)
        .await
        .unwrap_err();
    assert_eq!(err, ConnectivityError::ConnectionNotAccessible(ID.to_string()));
    assert!(snapshot(&respawned).await.client_ids.is_empty());

    let created = run(
        &respawned,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Closed)),
    )
    .await
    .expect("create after delete");
    assert!(matches!(created, ConnectivityResponse::Created(_)));
    assert_eq!(
        fx.events(),
        vec!["ConnectionCreated", "ConnectionDeleted", "ConnectionCreated"]
    );

    shut_down(&respawned).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_on_uninitialized_connection_passivates_without_persisting() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();

    let response = run(
        &supervisor,
        ConnectivityCommand::Test(connection(ConnectivityStatus::Open)),
    )
    .await
    .expect("test");
    assert_eq!(
        response,
        ConnectivityResponse::Tested("successfully connected + initialized mapper".to_string())
    );
    assert_eq!(fx.control().test_calls(), 1);
    assert_eq!(fx.control().connect_calls(), 0);
    tokio::time::timeout(Duration::from_secs(3), supervisor.wait_for_shutdown())
        .await
        .expect("supervisor passivates after test");
    assert!(fx.events().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_is_rejected_while_instances_run() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Open)),
    )
    .await
    .expect("create");

    let err = run(
        &supervisor,
        ConnectivityCommand::Test(connection(ConnectivityStatus::Open)),
    )
    .await
    .unwrap_err();
    assert_eq!(err, ConnectivityError::TestRejected(ID.to_string()));
    assert_eq!(fx.control().test_calls(), 0);

    shut_down(&supervisor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_test_is_reported_and_instance_removed() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Closed)),
    )
    .await
    .expect("create");
    fx.control().fail_test(true);

    let err = run(
        &supervisor,
        ConnectivityCommand::Test(connection(ConnectivityStatus::Open)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ConnectivityError::Driver { .. }));
    assert!(snapshot(&supervisor).await.client_ids.is_empty());
    assert_eq!(fx.events(), vec!["ConnectionCreated"]);

    shut_down(&supervisor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queries_without_instances_answer_defaults() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Closed)),
    )
    .await
    .expect("create");

    let ConnectivityResponse::Status(report) = run(&supervisor, ConnectivityCommand::RetrieveStatus)
        .await
        .expect("status")
    else {
        panic!("expected a status report");
    };
    assert_eq!(report.live_status, ConnectivityStatus::Closed);
    assert_eq!(report.desired_status, ConnectivityStatus::Closed);
    let client = report.client_records().next().expect("client record");
    assert_eq!(
        client.status_details.as_deref(),
        Some("[DISCONNECTED] connection is closed")
    );
    assert_eq!(client.in_state_since, Some(DateTime::<Utc>::UNIX_EPOCH));

    assert_eq!(
        run(&supervisor, ConnectivityCommand::RetrieveMetrics).await,
        Ok(ConnectivityResponse::Metrics(ConnectionMetrics::default()))
    );
    assert_eq!(
        run(&supervisor, ConnectivityCommand::RetrieveLogs).await,
        Ok(ConnectivityResponse::Logs(ConnectionLogs::default()))
    );

    shut_down(&supervisor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_of_open_connection_aggregates_instances() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Open).with_client_count(3)),
    )
    .await
    .expect("create");

    let ConnectivityResponse::Status(report) = run(&supervisor, ConnectivityCommand::RetrieveStatus)
        .await
        .expect("status")
    else {
        panic!("expected a status report");
    };
    assert_eq!(report.live_status, ConnectivityStatus::Open);
    assert_eq!(report.client_records().count(), 3);
    assert!(
        report
            .client_records()
            .all(|r| r.status_details.as_deref().is_some_and(|d| d.starts_with("[CONNECTED]")))
    );

    shut_down(&supervisor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_persist_leaves_entity_untouched() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Closed)),
    )
    .await
    .expect("create");

    fx.journal.set_failing(true);
    let err = run(&supervisor, ConnectivityCommand::Open)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectivityError::Persistence(_)));
    let snap = snapshot(&supervisor).await;
    assert_eq!(snap.revision, 1);
    assert_eq!(
        snap.entity.map(|c| c.connection_status),
        Some(ConnectivityStatus::Closed)
    );
    assert!(snap.client_ids.is_empty());

    shut_down(&supervisor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_and_conflicting_creates_are_rejected() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();

    let err = run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Open).with_client_count(0)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ConnectivityError::ConfigurationInvalid(_)));
    assert!(fx.events().is_empty());

    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Closed)),
    )
    .await
    .expect("create");
    let err = run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Closed)),
    )
    .await
    .unwrap_err();
    assert_eq!(err, ConnectivityError::ConnectionConflict(ID.to_string()));

    shut_down(&supervisor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logging_can_be_enabled_and_disabled() {
    let fx = Fixture::new();
    let supervisor = fx.spawn();
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Open)),
    )
    .await
    .expect("create");

    assert_eq!(
        run(&supervisor, ConnectivityCommand::EnableLogs).await,
        Ok(ConnectivityResponse::LogsEnabled)
    );
    assert!(snapshot(&supervisor).await.logging_enabled_until.is_some());
    let ConnectivityResponse::Logs(logs) = run(&supervisor, ConnectivityCommand::RetrieveLogs)
        .await
        .expect("logs")
    else {
        panic!("expected logs");
    };
    assert!(logs.enabled_until.is_some());

    assert_eq!(
        run(&supervisor, ConnectivityCommand::DisableLogs).await,
        Ok(ConnectivityResponse::LogsDisabled)
    );
    assert!(snapshot(&supervisor).await.logging_enabled_until.is_none());

    shut_down(&supervisor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn priority_change_persists_tagged_empty_event() {
    let fx = Fixture::new();
    let provider = StaticPriorityProvider::new(7);
    let mut config = config();
    config.supervisor.priority_update_interval = ms(100);
    let supervisor = ConnectionSupervisor::spawn(
        fx.args()
            .with_config(config)
            .with_priority_provider(provider.clone()),
    );
    run(
        &supervisor,
        ConnectivityCommand::Create(connection(ConnectivityStatus::Open)),
    )
    .await
    .expect("create");

    let journal = fx.journal.clone();
    assert!(
        eventually(Duration::from_secs(3), || {
            let journal = journal.clone();
            async move {
                journal.entries_of(ID).iter().any(|entry| {
                    matches!(&entry.event, ConnectivityEvent::Empty { effect } if effect == "priority-update")
                        && entry.tags.contains("priority:7")
                })
            }
        })
        .await
    );
    assert_eq!(snapshot(&supervisor).await.priority, Some(7));

    let before = empty_events(&fx.journal);
    tokio::time::sleep(ms(400)).await;
    assert!(provider.lookups() >= 2);
    assert_eq!(empty_events(&fx.journal), before);

    shut_down(&supervisor).await;
}
