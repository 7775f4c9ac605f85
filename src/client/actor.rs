//! Client instance actor.
//!
//! Owns one [`ClientMachine`] and one driver. Driver and bus I/O runs on spawned tasks whose
//! outcome is told back to the actor as machine input, so the mailbox never waits on the broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future;
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::fsm::{ClientMachine, MachineSettings, combine_test_results};
use super::state::{AnnouncementKind, ClientEvent, Effect, OriginId, StateTimer, Transition};
use crate::config::ClientConfig;
use crate::core::{
    ClientObserver, ClientState, Connection, ConnectionFailure, ConnectionLoggerRegistry,
    ConnectionLogs, ConnectionMetrics, ConnectionMetricsRegistry, ConnectivityError,
    ConnectivityResult, ConnectivityStatus, ConnectivityStatusResolver, DefaultStatusResolver,
    ResourceStatus, StatusReply, jitter_delay,
};
use crate::driver::{
    ClientDriver, ConnectionAnnouncement, DriverEvent, DriverEvents, DriverFuture,
};
use crate::pool::{ClientActorRefs, SearchCommand, SearchSessionHandler};
use crate::pubsub::{BusTerminated, MessageBus};
use crate::supervision::{ChildDirective, ChildSupervisionPolicy};

/// Channel on which an open, close or test is answered.
pub type ReplyTo = oneshot::Sender<StatusReply>;

/// Collaborators shared by every client instance of a process.
#[derive(Clone)]
pub struct ClientEnvironment {
    pub config: ClientConfig,
    pub bus: Arc<dyn MessageBus>,
    pub resolver: Arc<dyn ConnectivityStatusResolver>,
    pub observer: Option<Arc<dyn ClientObserver>>,
    pub search: Option<Arc<dyn SearchSessionHandler>>,
}

impl ClientEnvironment {
    pub fn new(config: ClientConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            config,
            bus,
            resolver: Arc::new(DefaultStatusResolver::default()),
            observer: None,
            search: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConnectivityStatusResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ClientObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchSessionHandler>) -> Self {
        self.search = Some(search);
        self
    }
}

/// Arguments passed when spawning a client instance.
pub struct ClientActorArgs<D: ClientDriver> {
    pub connection: Arc<Connection>,
    pub client_id: String,
    pub driver: D,
    pub env: ClientEnvironment,
    pub metrics: ConnectionMetricsRegistry,
    pub logs: Arc<ConnectionLoggerRegistry>,
    /// Skip pub/sub subscriptions, used for connection tests.
    pub dry_run: bool,
}

pub struct ClientActor<D: ClientDriver> {
    client_id: String,
    connection: Arc<Connection>,
    machine: ClientMachine,
    driver: D,
    env: ClientEnvironment,
    metrics: ConnectionMetricsRegistry,
    logs: Arc<ConnectionLoggerRegistry>,
    dry_run: bool,
    actor_ref: ActorRef<Self>,
    pending: HashMap<OriginId, ReplyTo>,
    next_origin: u64,
    probe_generation: u64,
    resource_generation: u64,
    state_timer: Option<JoinHandle<()>>,
    scheduled: Vec<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
    bus_fatal: mpsc::UnboundedSender<BusTerminated>,
    siblings: ClientActorRefs<D>,
    supervision: ChildSupervisionPolicy,
}

impl<D: ClientDriver> Actor for ClientActor<D> {
    type Args = ClientActorArgs<D>;
    type Error = ConnectivityError;

    fn name() -> &'static str {
        "ClientActor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> ConnectivityResult<Self> {
        let ClientActorArgs {
            connection,
            client_id,
            mut driver,
            env,
            metrics,
            logs,
            dry_run,
        } = args;

        let settings = MachineSettings::new(&connection, &env.config)?;
        let strategy = Box::new(env.config.reconnect_strategy()?);
        let machine = ClientMachine::new(
            settings,
            connection.connection_status,
            strategy,
            env.resolver.clone(),
            Utc::now(),
        );

        let (events, mut driver_rx) = DriverEvents::channel();
        driver.bind(events);
        let driver_forwarder = {
            let actor_ref = actor_ref.clone();
            tokio::spawn(async move {
                while let Some(event) = driver_rx.recv().await {
                    if actor_ref.tell(DriverNotification(event)).send().await.is_err() {
                        break;
                    }
                }
            })
        };

        let (bus_fatal, mut fatal_rx) = mpsc::unbounded_channel::<BusTerminated>();
        let bus_forwarder = {
            let actor_ref = actor_ref.clone();
            tokio::spawn(async move {
                while let Some(BusTerminated { reason }) = fatal_rx.recv().await {
                    let event = ClientEvent::BusTerminated { reason };
                    if actor_ref.tell(MachineInput(event)).send().await.is_err() {
                        break;
                    }
                }
            })
        };

        debug!(client = %client_id, connection = %connection.id, dry_run, "client instance starting");

        let mut actor = Self {
            client_id,
            connection,
            machine,
            driver,
            env,
            metrics,
            logs,
            dry_run,
            actor_ref,
            pending: HashMap::new(),
            next_origin: 0,
            probe_generation: 0,
            resource_generation: 0,
            state_timer: None,
            scheduled: Vec::new(),
            forwarders: vec![driver_forwarder, bus_forwarder],
            bus_fatal,
            siblings: ClientActorRefs::new(),
            supervision: ChildSupervisionPolicy,
        };
        actor.feed(ClientEvent::Initialize);
        Ok(actor)
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> ConnectivityResult<()> {
        debug!(client = %self.client_id, reason = ?reason, "client instance stopping");
        if let Some(timer) = self.state_timer.take() {
            timer.abort();
        }
        for task in self.scheduled.drain(..).chain(self.forwarders.drain(..)) {
            task.abort();
        }
        self.driver.cleanup_resources();
        if self.machine.data().ssh_tunnel.is_established() {
            self.driver.stop_tunnel();
        }
        self.env.bus.remove_subscriber(&self.client_id);
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(ConnectivityError::Actor(
                "client instance stopped".to_string(),
            )));
        }
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<ActorStopReason>, Self::Error>,
    > + Send {
        let client_id = self.client_id.clone();
        async move {
            tracing::error!(client = %client_id, error = ?err, "ClientActor panicked");
            Ok(std::ops::ControlFlow::Break(ActorStopReason::Panicked(err)))
        }
    }
}

impl<D: ClientDriver> ClientActor<D> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn register(&mut self, reply: Option<ReplyTo>) -> Option<OriginId> {
        let reply = reply?;
        self.next_origin += 1;
        let origin = OriginId(self.next_origin);
        self.pending.insert(origin, reply);
        Some(origin)
    }

    /// Run `event` through the machine; returns true when the instance must stop.
    fn feed(&mut self, event: ClientEvent) -> bool {
        debug!(
            client = %self.client_id,
            state = %self.machine.state(),
            event = event.name(),
            "client event"
        );
        let transition = self.machine.handle(event, Utc::now());
        self.execute(transition)
    }

    fn execute(&mut self, transition: Transition) -> bool {
        for (from, to) in &transition.changes {
            info!(client = %self.client_id, from = %from, to = %to, "client state transition");
            if let Some(observer) = &self.env.observer {
                observer.on_transition(&self.client_id, *from, *to);
            }
            if *to == ClientState::Connected {
                self.logs
                    .for_connection()
                    .success("Connection successfully established.");
            }
        }
        if !transition.changes.is_empty()
            && let Some(observer) = &self.env.observer
        {
            let data = self.machine.data();
            observer.on_status(&self.client_id, data.connectivity_status, &data.status_details);
        }
        for (_, reply) in transition.replies() {
            if let Err(err) = reply {
                self.logs.for_connection().failure(&err.to_string());
            }
        }

        let Transition { effects, timer, .. } = transition;
        self.apply_timer(timer);
        let mut stop = false;
        for effect in effects {
            stop |= self.run_effect(effect);
        }
        stop
    }

    fn apply_timer(&mut self, timer: StateTimer) {
        match timer {
            StateTimer::Keep => {}
            StateTimer::Cancel => {
                if let Some(handle) = self.state_timer.take() {
                    handle.abort();
                }
            }
            StateTimer::Start {
                after,
                generation,
                jitter,
            } => {
                if let Some(handle) = self.state_timer.take() {
                    handle.abort();
                }
                let delay = if jitter { jitter_delay(after) } else { after };
                let actor_ref = self.actor_ref.clone();
                self.state_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = actor_ref
                        .tell(MachineInput(ClientEvent::StateTimeout { generation }))
                        .send()
                        .await;
                }));
            }
        }
    }

    fn run_effect(&mut self, effect: Effect) -> bool {
        match effect {
            Effect::Reply { origin, reply } => {
                match self.pending.remove(&origin) {
                    Some(sender) => {
                        let _ = sender.send(reply);
                    }
                    None => debug!(client = %self.client_id, ?origin, "reply target vanished"),
                }
            }
            Effect::ProbeAndConnect { endpoints } => {
                self.spawn_probes(endpoints, AfterProbe::Connect, |_, _, error| {
                    ClientEvent::ProbeFailed { error }
                });
            }
            Effect::ProbeAndTest { endpoints } => {
                let connection_id = self.connection.id.clone();
                self.spawn_probes(endpoints, AfterProbe::Test, move |host, port, error| {
                    debug!(connection = %connection_id, error = %error, "probe before test failed");
                    ClientEvent::TestResult(Err(ConnectivityError::connection_failed(
                        connection_id,
                        format!(
                            "Could not establish a connection on '{host}:{port}'. Make sure the \
                             endpoint is reachable and that no firewall prevents the connection."
                        ),
                    )))
                });
            }
            Effect::InitializeResources => {
                self.driver.allocate_resources();
                self.resource_generation += 1;
                self.start_resource_stage(ResourceStage::Publisher);
            }
            Effect::CleanupResources => {
                self.resource_generation += 1;
                self.driver.cleanup_resources();
            }
            Effect::Unsubscribe => self.env.bus.remove_subscriber(&self.client_id),
            Effect::Disconnect { shutdown } => {
                let disconnect = self.driver.disconnect();
                let client_id = self.client_id.clone();
                self.spawn_input(async move {
                    if let Err(err) = disconnect.await {
                        warn!(client = %client_id, error = %err, "disconnect failed, treating client as disconnected");
                    }
                    ClientEvent::ClientDisconnected { shutdown }
                });
            }
            Effect::Announce(kind) => {
                let at = Utc::now();
                let announcement = match kind {
                    AnnouncementKind::Opened => ConnectionAnnouncement::Opened { at },
                    AnnouncementKind::Closed => ConnectionAnnouncement::Closed { at },
                };
                let send = self.driver.send_announcement(announcement);
                let client_id = self.client_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = send.await {
                        warn!(client = %client_id, ?kind, error = %err, "failed to send connection announcement");
                    }
                });
            }
            Effect::StartTunnel => {
                let start = self.driver.start_tunnel();
                self.spawn_input(async move {
                    match start.await {
                        Ok(local_port) => ClientEvent::TunnelStarted { local_port },
                        Err(err) => ClientEvent::TunnelClosed {
                            reason: err.to_string(),
                        },
                    }
                });
            }
            Effect::StopTunnel => self.driver.stop_tunnel(),
            Effect::Schedule { event, after } => {
                self.scheduled.retain(|task| !task.is_finished());
                let actor_ref = self.actor_ref.clone();
                self.scheduled.push(tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = actor_ref.tell(MachineInput(event)).send().await;
                }));
            }
            Effect::Stop => return true,
        }
        false
    }

    /// Probe `endpoints` one after the other. The driver operation `next` is only started once
    /// every probe passed; the first failing probe is turned into machine input by `failed`.
    fn spawn_probes<F>(&mut self, endpoints: Vec<(String, u16)>, next: AfterProbe, failed: F)
    where
        F: FnOnce(String, u16, ConnectivityError) -> ClientEvent + Send + 'static,
    {
        self.probe_generation += 1;
        let generation = self.probe_generation;
        let timeout = self.env.config.socket_probe_timeout;
        let probes: Vec<_> = endpoints
            .into_iter()
            .map(|(host, port)| {
                let probe = self.driver.probe(host.clone(), port, timeout);
                (host, port, probe)
            })
            .collect();
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            for (host, port, probe) in probes {
                if let Err(error) = probe.await {
                    let event = failed(host, port, error);
                    let _ = actor_ref.tell(MachineInput(event)).send().await;
                    return;
                }
            }
            let _ = actor_ref.tell(ProbesPassed { generation, next }).send().await;
        });
    }

    fn start_connect(&self) {
        let connect = self.driver.connect();
        self.spawn_input(async move {
            match connect.await {
                Ok(()) => ClientEvent::ClientConnected,
                Err(err) => {
                    let description = err.to_string();
                    ClientEvent::ConnectionFailure(ConnectionFailure::new(err, description))
                }
            }
        });
    }

    fn start_tests(&self) {
        let connection_test = self.driver.test_connection(self.connection.clone());
        let mapping_test = self.driver.test_mapping(self.connection.clone());
        self.spawn_input(async move {
            let (connection, mapping) = future::join(connection_test, mapping_test).await;
            ClientEvent::TestResult(combine_test_results(connection, mapping))
        });
    }

    /// Start one step of resource initialization; the next step is started by
    /// [`ResourceStarted`] only when this one succeeded.
    fn start_resource_stage(&self, stage: ResourceStage) {
        let work: DriverFuture<()> = match stage {
            ResourceStage::Publisher => self.driver.start_publisher(),
            ResourceStage::Consumers => self.driver.start_consumers(),
            ResourceStage::PubSub => {
                let bus = self.env.bus.clone();
                let client_id = self.client_id.clone();
                let group = self.connection.id.clone();
                let types = self.connection.streaming_types();
                let labels = self.connection.issued_ack_labels();
                let fatal = self.bus_fatal.clone();
                Box::pin(async move {
                    bus.subscribe(&client_id, types, fatal).await?;
                    bus.declare_ack_labels(&group, &client_id, labels).await
                })
            }
        };
        let generation = self.resource_generation;
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            let result = work.await;
            let _ = actor_ref
                .tell(ResourceStarted {
                    generation,
                    stage,
                    result,
                })
                .send()
                .await;
        });
    }

    fn spawn_input<F>(&self, work: F)
    where
        F: std::future::Future<Output = ClientEvent> + Send + 'static,
    {
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            let event = work.await;
            let _ = actor_ref.tell(MachineInput(event)).send().await;
        });
    }

    fn status_records(&self) -> Vec<ResourceStatus> {
        let data = self.machine.data();
        let mut records = vec![ResourceStatus::client(
            &self.client_id,
            data.connectivity_status,
            format!("[{}] {}", self.machine.state(), data.status_details),
            data.in_status_since,
        )];
        let resources = self.driver.resource_statuses();
        let missing_reason = match data.connectivity_status {
            ConnectivityStatus::Failed => Some("failure"),
            ConnectivityStatus::Misconfigured => Some("misconfiguration"),
            ConnectivityStatus::Unknown => Some("unknown"),
            _ => None,
        };
        if let Some(reason) = missing_reason {
            for (resource_type, expected) in self.connection.expected_resources() {
                let reported = resources
                    .iter()
                    .filter(|r| r.resource_type == resource_type)
                    .count();
                for _ in reported..expected {
                    records.push(ResourceStatus::closed(
                        resource_type,
                        &self.client_id,
                        None,
                        format!("Closed because of {reason} status in client."),
                    ));
                }
            }
        }
        records.extend(resources);
        records
    }

    fn serve_search(&self, command: SearchCommand) {
        match (&self.env.search, self.machine.state()) {
            (Some(handler), ClientState::Connected) => handler.handle(&self.client_id, command),
            (_, state) => debug!(
                client = %self.client_id,
                state = %state,
                subscription = command.subscription_id(),
                "dropping search command, client cannot serve it"
            ),
        }
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let data = self.machine.data();
        ClientSnapshot {
            client_id: self.client_id.clone(),
            state: self.machine.state(),
            status: data.connectivity_status,
            details: data.status_details.clone(),
            desired_status: data.desired_status,
            failure_count: data.failure_count,
            in_status_since: data.in_status_since,
        }
    }
}

/// Point-in-time view of a client instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub state: ClientState,
    pub status: ConnectivityStatus,
    pub details: String,
    pub desired_status: ConnectivityStatus,
    pub failure_count: u32,
    pub in_status_since: DateTime<Utc>,
}

/// Whether an instance's operator logs are still enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingActivity {
    Active,
    /// The enabled window passed; the instance muted its loggers.
    Expired,
    Inactive,
}

pub struct OpenConnection {
    reply: Option<ReplyTo>,
}

impl OpenConnection {
    pub fn new() -> Self {
        Self { reply: None }
    }

    pub fn replying(reply: ReplyTo) -> Self {
        Self { reply: Some(reply) }
    }
}

impl Default for OpenConnection {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CloseConnection {
    shutdown: bool,
    reply: Option<ReplyTo>,
}

impl CloseConnection {
    pub fn new() -> Self {
        Self {
            shutdown: false,
            reply: None,
        }
    }

    pub fn replying(reply: ReplyTo) -> Self {
        Self {
            shutdown: false,
            reply: Some(reply),
        }
    }

    /// Stop the instance once it is disconnected.
    pub fn and_shutdown(mut self) -> Self {
        self.shutdown = true;
        self
    }
}

impl Default for CloseConnection {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TestConnection {
    reply: Option<ReplyTo>,
}

impl TestConnection {
    pub fn replying(reply: ReplyTo) -> Self {
        Self { reply: Some(reply) }
    }
}

pub struct RetrieveClientStatus;
pub struct RetrieveClientMetrics;
pub struct ResetClientMetrics;
pub struct EnableClientLogs {
    pub duration: Duration,
}
pub struct DisableClientLogs;
pub struct RetrieveClientLogs;
pub struct ResetClientLogs;
pub struct CheckLogsActive;
pub struct GetClientSnapshot;

/// Replace the instance's view of its siblings.
pub struct UpdateSiblings<D: ClientDriver>(ClientActorRefs<D>);

impl<D: ClientDriver> UpdateSiblings<D> {
    pub fn new(siblings: ClientActorRefs<D>) -> Self {
        Self(siblings)
    }
}

/// Search command to serve here or hand to the sibling owning its subscription.
pub struct ForwardSearchCommand(pub SearchCommand);

/// Outcome of spawned work, fed back into the machine.
pub struct MachineInput(ClientEvent);

pub struct DriverNotification(DriverEvent);

/// Driver operation started once the reachability probes passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterProbe {
    Connect,
    Test,
}

struct ProbesPassed {
    generation: u64,
    next: AfterProbe,
}

/// Resource initialization after the client connected: publisher, then consumers, then the
/// pub/sub subscription and acknowledgement labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceStage {
    Publisher,
    Consumers,
    PubSub,
}

impl ResourceStage {
    fn next(self, dry_run: bool) -> Option<Self> {
        match self {
            Self::Publisher => Some(Self::Consumers),
            Self::Consumers if dry_run => None,
            Self::Consumers => Some(Self::PubSub),
            Self::PubSub => None,
        }
    }
}

struct ResourceStarted {
    generation: u64,
    stage: ResourceStage,
    result: ConnectivityResult<()>,
}

impl<D: ClientDriver> KameoMessage<OpenConnection> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        msg: OpenConnection,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let origin = self.register(msg.reply);
        if self.feed(ClientEvent::Open { origin }) {
            ctx.stop();
        }
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<CloseConnection> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        msg: CloseConnection,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let origin = self.register(msg.reply);
        let event = ClientEvent::Close {
            origin,
            shutdown: msg.shutdown,
        };
        if self.feed(event) {
            ctx.stop();
        }
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<TestConnection> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        msg: TestConnection,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let origin = self.register(msg.reply);
        if self.feed(ClientEvent::Test { origin }) {
            ctx.stop();
        }
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<MachineInput> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        MachineInput(event): MachineInput,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.feed(event) {
            ctx.stop();
        }
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<ProbesPassed> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        ProbesPassed { generation, next }: ProbesPassed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let state = self.machine.state();
        match next {
            _ if generation != self.probe_generation => {
                debug!(client = %self.client_id, ?next, "superseded probe result dropped")
            }
            AfterProbe::Connect if state == ClientState::Connecting => self.start_connect(),
            AfterProbe::Test if state == ClientState::Testing => self.start_tests(),
            _ => debug!(client = %self.client_id, ?next, state = %state, "probe passed after state change"),
        }
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<ResourceStarted> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        ResourceStarted {
            generation,
            stage,
            result,
        }: ResourceStarted,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if generation != self.resource_generation {
            debug!(client = %self.client_id, ?stage, "resources cleaned up, dropping initialization step");
            return Ok(());
        }
        let event = match (result, stage.next(self.dry_run)) {
            (Err(err), _) => ClientEvent::InitializationResult(Err(err)),
            (Ok(()), Some(next)) => {
                self.start_resource_stage(next);
                return Ok(());
            }
            (Ok(()), None) => ClientEvent::InitializationResult(Ok(())),
        };
        if self.feed(event) {
            ctx.stop();
        }
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<DriverNotification> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        DriverNotification(event): DriverNotification,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let event = match event {
            DriverEvent::ConnectionFailure(failure) => ClientEvent::ConnectionFailure(failure),
            DriverEvent::TunnelClosed(reason) => ClientEvent::TunnelClosed { reason },
            DriverEvent::ChildFailed { child, error } => {
                match self.supervision.decide(&child, &error) {
                    ChildDirective::ResumeAndForward(message) => {
                        debug!(client = %self.client_id, ?child, "forwarding protocol error of child");
                        self.driver.forward_protocol_error(message);
                        return Ok(());
                    }
                    ChildDirective::Restart => {
                        info!(client = %self.client_id, ?child, "restarting failed child");
                        self.driver.restart_child(&child);
                        return Ok(());
                    }
                    ChildDirective::StopAndFail(failure) => {
                        warn!(client = %self.client_id, ?child, failure = %failure.description, "child failed, failing connection");
                        self.driver.stop_child(&child);
                        ClientEvent::ConnectionFailure(failure)
                    }
                }
            }
        };
        if self.feed(event) {
            ctx.stop();
        }
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<RetrieveClientStatus> for ClientActor<D> {
    type Reply = ConnectivityResult<Vec<ResourceStatus>>;

    async fn handle(
        &mut self,
        _msg: RetrieveClientStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.status_records())
    }
}

impl<D: ClientDriver> KameoMessage<RetrieveClientMetrics> for ClientActor<D> {
    type Reply = ConnectivityResult<ConnectionMetrics>;

    async fn handle(
        &mut self,
        _msg: RetrieveClientMetrics,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.metrics.snapshot())
    }
}

impl<D: ClientDriver> KameoMessage<ResetClientMetrics> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        _msg: ResetClientMetrics,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.metrics.reset();
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<EnableClientLogs> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        msg: EnableClientLogs,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(client = %self.client_id, duration = ?msg.duration, "enabling connection logs");
        self.logs.enable(Utc::now(), msg.duration);
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<DisableClientLogs> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        _msg: DisableClientLogs,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.logs.mute();
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<RetrieveClientLogs> for ClientActor<D> {
    type Reply = ConnectivityResult<ConnectionLogs>;

    async fn handle(
        &mut self,
        _msg: RetrieveClientLogs,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.logs.aggregate())
    }
}

impl<D: ClientDriver> KameoMessage<ResetClientLogs> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        _msg: ResetClientLogs,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.logs.reset();
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<CheckLogsActive> for ClientActor<D> {
    type Reply = ConnectivityResult<LoggingActivity>;

    async fn handle(
        &mut self,
        _msg: CheckLogsActive,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let now = Utc::now();
        if self.logs.mute_if_expired(now) {
            info!(client = %self.client_id, "connection logs expired, muted");
            return Ok(LoggingActivity::Expired);
        }
        Ok(if self.logs.is_active(now) {
            LoggingActivity::Active
        } else {
            LoggingActivity::Inactive
        })
    }
}

impl<D: ClientDriver> KameoMessage<GetClientSnapshot> for ClientActor<D> {
    type Reply = ConnectivityResult<ClientSnapshot>;

    async fn handle(
        &mut self,
        _msg: GetClientSnapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.snapshot())
    }
}

impl<D: ClientDriver> KameoMessage<UpdateSiblings<D>> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        UpdateSiblings(siblings): UpdateSiblings<D>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(
            client = %self.client_id,
            siblings = siblings.len(),
            index = ?siblings.position(&self.client_id),
            "received client instance refs"
        );
        self.siblings = siblings;
        Ok(())
    }
}

impl<D: ClientDriver> KameoMessage<ForwardSearchCommand> for ClientActor<D> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        ForwardSearchCommand(command): ForwardSearchCommand,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let client_count = self.siblings.len();
        let owner = if client_count > 1 {
            self.siblings
                .route(command.subscription_id(), client_count)
                .filter(|handle| handle.client_id != self.client_id)
                .cloned()
        } else {
            None
        };
        match owner {
            Some(handle) => {
                debug!(
                    client = %self.client_id,
                    owner = %handle.client_id,
                    subscription = command.subscription_id(),
                    "forwarding search command to owning client"
                );
                if handle
                    .actor
                    .tell(ForwardSearchCommand(command))
                    .send()
                    .await
                    .is_err()
                {
                    warn!(client = %self.client_id, owner = %handle.client_id, "owning client is gone, dropping search command");
                }
            }
            None => self.serve_search(command),
        }
        Ok(())
    }
}
