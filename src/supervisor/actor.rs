//! Persistent connection supervisor.
//!
//! One supervisor per connection id. It recovers the connection entity from the journal, stages
//! every management command into a list of actions and interprets them. Actions that wait on
//! client instances run on spawned tasks and re-enter the interpreter through [`StepCompleted`].

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kameo::actor::ActorId;
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::commands::{ConnectionStatusReport, ConnectivityCommand, ConnectivityResponse};
use super::events::{
    ConnectivityEvent, JournalEntry, PRIORITY_UPDATE_EFFECT, journal_tags, priority_from_tags,
    tags_for_event,
};
use super::journal::EventJournal;
use super::priority::{PriorityProvider, fuzzy_interval};
use super::staged::{ConnectionAction, StagedCommand};
use super::strategies::{self, Lifecycle};
use crate::client::{
    CheckLogsActive, ClientEnvironment, DisableClientLogs, EnableClientLogs, ForwardSearchCommand,
    LoggingActivity, ResetClientLogs, ResetClientMetrics, RetrieveClientLogs,
    RetrieveClientMetrics, RetrieveClientStatus,
};
use crate::config::{ConnectivityConfig, MonitoringConfig, SupervisorConfig};
use crate::core::{
    ClientObserver, CommandHeaders, Connection, ConnectionLogs, ConnectionMetrics,
    ConnectivityError, ConnectivityResult, ConnectivityStatus, StatusReply,
};
use crate::driver::DriverFactory;
use crate::pool::{
    ClientPool, PoolSettings, SearchCommand, SearchSessionHandler, SubscriptionCounter,
    send_failure,
};
use crate::pubsub::MessageBus;
use crate::supervision;

/// Arguments passed when spawning a connection supervisor.
pub struct SupervisorArgs<F: DriverFactory> {
    pub connection_id: String,
    pub factory: Arc<F>,
    pub journal: Arc<dyn EventJournal>,
    pub bus: Arc<dyn MessageBus>,
    pub config: ConnectivityConfig,
    pub observer: Option<Arc<dyn ClientObserver>>,
    pub search: Option<Arc<dyn SearchSessionHandler>>,
    pub priority: Option<Arc<dyn PriorityProvider>>,
}

impl<F: DriverFactory> SupervisorArgs<F> {
    pub fn new(
        connection_id: impl Into<String>,
        factory: Arc<F>,
        journal: Arc<dyn EventJournal>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            factory,
            journal,
            bus,
            config: ConnectivityConfig::default(),
            observer: None,
            search: None,
            priority: None,
        }
    }

    pub fn with_config(mut self, config: ConnectivityConfig) -> Self {
        self.config = config;
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

    pub fn with_priority_provider(mut self, provider: Arc<dyn PriorityProvider>) -> Self {
        self.priority = Some(provider);
        self
    }
}

/// Asynchronous action a staged command is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsyncStep {
    Open { ignore_errors: bool },
    Close,
    Test,
}

pub struct ConnectionSupervisor<F: DriverFactory> {
    connection_id: String,
    factory: Arc<F>,
    journal: Arc<dyn EventJournal>,
    env: ClientEnvironment,
    config: SupervisorConfig,
    monitoring: MonitoringConfig,
    priority_provider: Option<Arc<dyn PriorityProvider>>,
    actor_ref: ActorRef<Self>,
    entity: Option<Connection>,
    lifecycle: Lifecycle,
    revision: u64,
    pool: Option<ClientPool<F::Driver>>,
    priority: Option<i32>,
    logging_enabled_until: Option<DateTime<Utc>>,
    logging_checker: Option<JoinHandle<()>>,
    priority_timer: Option<JoinHandle<()>>,
    connection_closed_at: Option<DateTime<Utc>>,
    subscription_counter: SubscriptionCounter,
}

impl<F: DriverFactory> Actor for ConnectionSupervisor<F> {
    type Args = SupervisorArgs<F>;
    type Error = ConnectivityError;

    fn name() -> &'static str {
        "ConnectionSupervisor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> ConnectivityResult<Self> {
        let SupervisorArgs {
            connection_id,
            factory,
            journal,
            bus,
            config,
            observer,
            search,
            priority: priority_provider,
        } = args;
        config.validate()?;

        let entries = journal.replay(&connection_id).await?;
        let mut entity = None;
        let mut revision = 0;
        let mut priority = None;
        for entry in &entries {
            entity = entry.event.apply(entity);
            revision = entry.revision;
            if let Some(p) = priority_from_tags(&entry.tags) {
                priority = Some(p);
            }
        }
        let lifecycle = Lifecycle::of(entity.as_ref());
        info!(
            connection = %connection_id,
            revision,
            lifecycle = ?lifecycle,
            "connection supervisor recovered"
        );

        let mut env = ClientEnvironment::new(config.client.clone(), bus)
            .with_resolver(Arc::new(config.monitoring.status_resolver()));
        env.observer = observer;
        env.search = search;

        let mut supervisor = Self {
            connection_id,
            factory,
            journal,
            env,
            config: config.supervisor,
            monitoring: config.monitoring,
            priority_provider,
            actor_ref,
            entity,
            lifecycle,
            revision,
            pool: None,
            priority,
            logging_enabled_until: None,
            logging_checker: None,
            priority_timer: None,
            connection_closed_at: None,
            subscription_counter: SubscriptionCounter::default(),
        };

        if lifecycle == Lifecycle::Created {
            supervisor.start_priority_timer();
        }
        if let Some(staged) = supervisor.entity.as_ref().and_then(strategies::recovery) {
            info!(connection = %supervisor.connection_id, "connection desired open, reopening after recovery");
            supervisor.interpret(staged).await;
        }
        Ok(supervisor)
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> ConnectivityResult<()> {
        info!(connection = %self.connection_id, reason = ?reason, "connection supervisor stopping");
        for timer in [self.logging_checker.take(), self.priority_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        if let Some(mut pool) = self.pool.take() {
            pool.stop().await;
        }
        Ok(())
    }

    fn on_link_died(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        id: ActorId,
        reason: ActorStopReason,
    ) -> impl std::future::Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send
    {
        async move {
            let Some(pool) = self.pool.as_mut() else {
                return Ok(ControlFlow::Continue(()));
            };
            if !pool.contains(id) {
                return Ok(ControlFlow::Continue(()));
            }
            if supervision::escalates(&reason) {
                error!(
                    connection = %self.connection_id,
                    reason = ?reason,
                    "client instance died, escalating"
                );
                return Ok(ControlFlow::Break(reason));
            }
            debug!(connection = %self.connection_id, reason = ?reason, "client instance stopped");
            pool.forget(id);
            if pool.is_empty() {
                self.pool = None;
                self.connection_closed_at = Some(Utc::now());
            }
            Ok(ControlFlow::Continue(()))
        }
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send
    {
        let connection_id = self.connection_id.clone();
        async move {
            error!(connection = %connection_id, error = ?err, "ConnectionSupervisor panicked");
            Ok(ControlFlow::Break(ActorStopReason::Panicked(err)))
        }
    }
}

impl<F: DriverFactory> ConnectionSupervisor<F> {
    /// Run the remaining actions of `staged`; returns true when the supervisor must passivate.
    async fn interpret(&mut self, mut staged: StagedCommand) -> bool {
        use ConnectionAction as A;

        while let Some(action) = staged.next_action() {
            debug!(
                connection = %self.connection_id,
                command = staged.command.name(),
                action = ?action,
                "staged action"
            );
            match action {
                A::TestConnection => match self.test_connection(staged).await {
                    Some(next) => staged = next,
                    None => return false,
                },
                A::ApplyEvent => {
                    if let Some(event) = staged.event.clone() {
                        self.apply_event(&event);
                    }
                }
                A::PersistAndApplyEvent => {
                    let Some(event) = staged.event.clone() else {
                        staged.fail(ConnectivityError::Actor(
                            "no event staged to persist".to_string(),
                        ));
                        return false;
                    };
                    let correlation_id = staged.headers.correlation_id.clone();
                    if let Err(err) = self
                        .persist_and_apply(event, correlation_id, BTreeSet::new())
                        .await
                    {
                        warn!(connection = %self.connection_id, error = %err, "persisting event failed");
                        staged.fail(err);
                        return false;
                    }
                }
                A::SendResponse => staged.send_response(),
                A::Passivate => {
                    info!(connection = %self.connection_id, "passivating connection supervisor");
                    return true;
                }
                A::OpenConnection | A::OpenConnectionIgnoreErrors => {
                    let ignore_errors = action == A::OpenConnectionIgnoreErrors;
                    match self.open_connection(staged, ignore_errors).await {
                        Some(next) => staged = next,
                        None => return false,
                    }
                }
                A::CloseConnection => match self.close_connection(staged) {
                    Some(next) => staged = next,
                    None => return false,
                },
                A::StopClientActors => self.stop_client_actors().await,
                A::BecomeCreated => self.become_created(),
                A::BecomeDeleted => self.become_deleted(),
                A::UpdateSubscriptions => self.update_subscriptions().await,
                A::BroadcastToClientActorsIfStarted => {
                    self.broadcast_command(&staged.command).await
                }
                A::RetrieveConnectionStatus => self.retrieve_status(&mut staged),
                A::RetrieveConnectionMetrics => self.retrieve_metrics(&mut staged),
                A::RetrieveConnectionLogs => self.retrieve_logs(&mut staged),
                A::EnableLogging => self.enable_logging(),
                A::DisableLogging => self.disable_logging(),
            }
        }
        false
    }

    /// Run `work` off the mailbox and resume `staged` with its outcome.
    fn continue_after<W>(&self, staged: StagedCommand, step: AsyncStep, work: W)
    where
        W: std::future::Future<Output = StatusReply> + Send + 'static,
    {
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            let result = work.await;
            let _ = actor_ref
                .tell(StepCompleted {
                    staged,
                    step,
                    result,
                })
                .send()
                .await;
        });
    }

    fn apply_event(&mut self, event: &ConnectivityEvent) {
        self.entity = event.apply(self.entity.take());
    }

    async fn persist_and_apply(
        &mut self,
        event: ConnectivityEvent,
        correlation_id: Option<String>,
        extra_tags: BTreeSet<String>,
    ) -> ConnectivityResult<()> {
        let mut tags = tags_for_event(&event, self.entity.as_ref(), self.priority);
        tags.extend(extra_tags);
        let entry = JournalEntry {
            connection_id: self.connection_id.clone(),
            revision: self.revision + 1,
            timestamp: Utc::now(),
            correlation_id,
            tags,
            event: event.clone(),
        };
        self.journal.append(entry).await?;
        self.revision += 1;
        self.apply_event(&event);
        debug!(
            connection = %self.connection_id,
            revision = self.revision,
            event = event.name(),
            "event persisted"
        );
        Ok(())
    }

    fn desired_status(&self) -> ConnectivityStatus {
        self.entity
            .as_ref()
            .map_or(ConnectivityStatus::Unknown, |c| c.connection_status)
    }

    async fn start_client_actors_if_required(
        &mut self,
        connection: Arc<Connection>,
        client_count: usize,
        dry_run: bool,
    ) -> ConnectivityResult<()> {
        if self.pool.is_some() {
            return Ok(());
        }
        let settings = PoolSettings {
            client_count,
            dry_run,
            ask_timeout: self.config.client_actor_ask_timeout,
            success_log_capacity: self.monitoring.success_log_capacity,
            failure_log_capacity: self.monitoring.failure_log_capacity,
        };
        let pool = ClientPool::start(
            connection,
            settings,
            self.factory.as_ref(),
            &self.env,
            &self.actor_ref,
        )
        .await?;
        self.pool = Some(pool);
        self.update_logging_if_enabled().await;
        Ok(())
    }

    async fn stop_client_actors(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.stop().await;
        }
        self.connection_closed_at = Some(Utc::now());
    }

    async fn open_connection(
        &mut self,
        staged: StagedCommand,
        ignore_errors: bool,
    ) -> Option<StagedCommand> {
        let Some(entity) = self.entity.clone() else {
            staged.fail(ConnectivityError::ConnectionNotAccessible(
                self.connection_id.clone(),
            ));
            return None;
        };
        let client_count = entity.client_count;
        if let Err(err) = self
            .start_client_actors_if_required(Arc::new(entity), client_count, false)
            .await
        {
            if ignore_errors {
                warn!(connection = %self.connection_id, error = %err, "starting client instances failed, ignoring");
                return Some(staged);
            }
            staged.fail(err);
            return None;
        }
        let Some(pool) = &self.pool else {
            return Some(staged);
        };
        let refs = pool.refs().clone();
        let timeout = self.config.client_actor_ask_timeout;
        self.continue_after(staged, AsyncStep::Open { ignore_errors }, async move {
            refs.open_all(timeout).await
        });
        None
    }

    fn close_connection(&mut self, staged: StagedCommand) -> Option<StagedCommand> {
        let Some(pool) = &self.pool else {
            return Some(staged);
        };
        let refs = pool.refs().clone();
        let timeout = self.config.client_actor_ask_timeout;
        self.continue_after(staged, AsyncStep::Close, async move {
            refs.close_all(timeout).await
        });
        None
    }

    async fn test_connection(&mut self, staged: StagedCommand) -> Option<StagedCommand> {
        if self.pool.is_some() {
            staged.fail(ConnectivityError::TestRejected(self.connection_id.clone()));
            return None;
        }
        let connection = match (&staged.command, &self.entity) {
            (ConnectivityCommand::Test(connection), _) => connection.clone(),
            (_, Some(entity)) => entity.clone(),
            (_, None) => {
                staged.fail(ConnectivityError::ConnectionNotAccessible(
                    self.connection_id.clone(),
                ));
                return None;
            }
        };
        let connection = Arc::new(connection.with_status(ConnectivityStatus::Closed));
        if let Err(err) = self.start_client_actors_if_required(connection, 1, true).await {
            staged.fail(err);
            return None;
        }
        let Some(pool) = &self.pool else {
            return Some(staged);
        };
        let refs = pool.refs().clone();
        let timeout = self.config.client_actor_ask_timeout;
        self.continue_after(staged, AsyncStep::Test, async move {
            refs.test_first(timeout).await
        });
        None
    }

    fn become_created(&mut self) {
        self.lifecycle = Lifecycle::Created;
        self.start_priority_timer();
    }

    fn become_deleted(&mut self) {
        self.lifecycle = Lifecycle::Deleted;
        for timer in [self.logging_checker.take(), self.priority_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        self.logging_enabled_until = None;
    }

    async fn update_subscriptions(&mut self) {
        if self.desired_status() != ConnectivityStatus::Open {
            return;
        }
        if self.logging_enabled_until.is_some() {
            self.start_logging_checker();
        }
        self.update_logging_if_enabled().await;
    }

    /// Re-enable logs on (possibly new) client instances for the rest of the enabled window.
    async fn update_logging_if_enabled(&self) {
        let (Some(until), Some(pool)) = (self.logging_enabled_until, &self.pool) else {
            return;
        };
        let Ok(remaining) = (until - Utc::now()).to_std() else {
            return;
        };
        pool.refs()
            .tell_all(|| EnableClientLogs {
                duration: remaining,
            })
            .await;
    }

    async fn broadcast_command(&self, command: &ConnectivityCommand) {
        let Some(pool) = &self.pool else {
            debug!(connection = %self.connection_id, command = command.name(), "no client instances to broadcast to");
            return;
        };
        let refs = pool.refs();
        match command {
            ConnectivityCommand::EnableLogs => {
                let duration = self.config.logging_enabled_duration;
                refs.tell_all(|| EnableClientLogs { duration }).await
            }
            ConnectivityCommand::DisableLogs => refs.tell_all(|| DisableClientLogs).await,
            ConnectivityCommand::ResetLogs => refs.tell_all(|| ResetClientLogs).await,
            ConnectivityCommand::ResetMetrics => refs.tell_all(|| ResetClientMetrics).await,
            other => {
                warn!(connection = %self.connection_id, command = other.name(), "command cannot be broadcast to client instances")
            }
        }
    }

    fn enable_logging(&mut self) {
        let until = chrono::Duration::from_std(self.config.logging_enabled_duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.logging_enabled_until = Some(until);
        self.start_logging_checker();
    }

    fn disable_logging(&mut self) {
        self.logging_enabled_until = None;
        if let Some(checker) = self.logging_checker.take() {
            checker.abort();
        }
    }

    fn start_logging_checker(&mut self) {
        if self
            .logging_checker
            .as_ref()
            .is_some_and(|checker| !checker.is_finished())
        {
            return;
        }
        let actor_ref = self.actor_ref.clone();
        let interval = self.config.check_logging_active_interval;
        self.logging_checker = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if actor_ref.tell(CheckLoggingActive).send().await.is_err() {
                    break;
                }
            }
        }));
    }

    fn start_priority_timer(&mut self) {
        if self.priority_provider.is_none() {
            return;
        }
        if let Some(timer) = self.priority_timer.take() {
            timer.abort();
        }
        let actor_ref = self.actor_ref.clone();
        let interval = self.config.priority_update_interval;
        self.priority_timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(fuzzy_interval(interval)).await;
                if actor_ref.tell(TriggerPriorityUpdate).send().await.is_err() {
                    break;
                }
            }
        }));
    }

    fn retrieve_status(&self, staged: &mut StagedCommand) {
        let desired = self.desired_status();
        let Some(pool) = &self.pool else {
            staged.respond(Ok(ConnectivityResponse::Status(ConnectionStatusReport::closed(
                &self.connection_id,
                desired,
                self.connection_closed_at,
            ))));
            return;
        };
        let refs = pool.refs().clone();
        let timeout = self.config.query_timeout(staged.headers.timeout);
        let connection_id = self.connection_id.clone();
        let reply = staged.take_reply();
        tokio::spawn(async move {
            let resources = refs
                .collect(timeout, |actor| async move {
                    actor.ask(RetrieveClientStatus).await.map_err(send_failure)
                })
                .await
                .into_iter()
                .flatten()
                .collect();
            let report = ConnectionStatusReport::new(connection_id, desired, resources);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(ConnectivityResponse::Status(report)));
            }
        });
    }

    fn retrieve_metrics(&self, staged: &mut StagedCommand) {
        let Some(pool) = &self.pool else {
            staged.respond(Ok(ConnectivityResponse::Metrics(ConnectionMetrics::default())));
            return;
        };
        let refs = pool.refs().clone();
        let timeout = self.config.query_timeout(staged.headers.timeout);
        let reply = staged.take_reply();
        tokio::spawn(async move {
            let metrics = refs
                .collect(timeout, |actor| async move {
                    actor.ask(RetrieveClientMetrics).await.map_err(send_failure)
                })
                .await
                .into_iter()
                .fold(ConnectionMetrics::default(), ConnectionMetrics::merge);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(ConnectivityResponse::Metrics(metrics)));
            }
        });
    }

    fn retrieve_logs(&self, staged: &mut StagedCommand) {
        let Some(pool) = &self.pool else {
            staged.respond(Ok(ConnectivityResponse::Logs(ConnectionLogs::default())));
            return;
        };
        let refs = pool.refs().clone();
        let timeout = self.config.query_timeout(staged.headers.timeout);
        let reply = staged.take_reply();
        tokio::spawn(async move {
            let logs = refs
                .collect(timeout, |actor| async move {
                    actor.ask(RetrieveClientLogs).await.map_err(send_failure)
                })
                .await
                .into_iter()
                .fold(ConnectionLogs::default(), ConnectionLogs::merge);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(ConnectivityResponse::Logs(logs)));
            }
        });
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            lifecycle: self.lifecycle,
            revision: self.revision,
            entity: self.entity.clone(),
            client_ids: self
                .pool
                .as_ref()
                .map(|pool| pool.refs().iter().map(|h| h.client_id.clone()).collect())
                .unwrap_or_default(),
            priority: self.priority,
            logging_enabled_until: self.logging_enabled_until,
            connection_closed_at: self.connection_closed_at,
        }
    }
}

/// Point-in-time view of a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    pub lifecycle: Lifecycle,
    pub revision: u64,
    pub entity: Option<Connection>,
    pub client_ids: Vec<String>,
    pub priority: Option<i32>,
    pub logging_enabled_until: Option<DateTime<Utc>>,
    pub connection_closed_at: Option<DateTime<Utc>>,
}

/// Management command with an optional reply channel.
pub struct ExecuteCommand {
    command: ConnectivityCommand,
    headers: CommandHeaders,
    reply: Option<oneshot::Sender<ConnectivityResult<ConnectivityResponse>>>,
}

impl ExecuteCommand {
    pub fn new(command: ConnectivityCommand, headers: CommandHeaders) -> Self {
        Self {
            command,
            headers,
            reply: None,
        }
    }

    pub fn replying(
        command: ConnectivityCommand,
        headers: CommandHeaders,
        reply: oneshot::Sender<ConnectivityResult<ConnectivityResponse>>,
    ) -> Self {
        Self {
            command,
            headers,
            reply: Some(reply),
        }
    }
}

/// Send `command` and wait for its response, bounded by the header timeout when one is set.
pub async fn execute<F: DriverFactory>(
    supervisor: &ActorRef<ConnectionSupervisor<F>>,
    command: ConnectivityCommand,
    headers: CommandHeaders,
) -> ConnectivityResult<ConnectivityResponse> {
    let name = command.name();
    let timeout = headers.timeout;
    let (tx, rx) = oneshot::channel();
    supervisor
        .tell(ExecuteCommand::replying(command, headers, tx))
        .send()
        .await
        .map_err(|_| ConnectivityError::Actor("connection supervisor is not running".to_string()))?;
    let response = async {
        rx.await.unwrap_or_else(|_| {
            Err(ConnectivityError::Actor(format!(
                "connection supervisor dropped {name}"
            )))
        })
    };
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, response)
            .await
            .unwrap_or_else(|_| {
                Err(ConnectivityError::Timeout {
                    context: format!("waiting for response to {name}"),
                })
            }),
        None => response.await,
    }
}

struct StepCompleted {
    staged: StagedCommand,
    step: AsyncStep,
    result: StatusReply,
}

struct CheckLoggingActive;
struct LoggingExpired;
struct TriggerPriorityUpdate;

/// Priority looked up for the connection.
pub struct UpdatePriority {
    pub priority: i32,
    pub correlation_id: Option<String>,
}

/// Start a search session; replies with the assigned subscription id.
pub struct StartSearchSession {
    pub filter: Option<String>,
}

/// Follow-up command of a running search session.
pub struct ForwardSearch(pub SearchCommand);

pub struct GetSupervisorSnapshot;

impl<F: DriverFactory> KameoMessage<ExecuteCommand> for ConnectionSupervisor<F> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        msg: ExecuteCommand,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let ExecuteCommand {
            command,
            headers,
            reply,
        } = msg;
        info!(
            connection = %self.connection_id,
            command = command.name(),
            lifecycle = ?self.lifecycle,
            correlation_id = ?headers.correlation_id,
            "handling command"
        );
        match strategies::stage(
            self.lifecycle,
            &self.connection_id,
            self.entity.as_ref(),
            command,
            headers,
        ) {
            Ok(staged) => {
                if self.interpret(staged.with_reply(reply)).await {
                    ctx.stop();
                }
            }
            Err(err) => {
                info!(connection = %self.connection_id, error = %err, "command rejected");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
            }
        }
        Ok(())
    }
}

impl<F: DriverFactory> KameoMessage<StepCompleted> for ConnectionSupervisor<F> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        msg: StepCompleted,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let StepCompleted {
            mut staged,
            step,
            result,
        } = msg;
        match (step, result) {
            (AsyncStep::Open { .. } | AsyncStep::Close, Ok(_)) => {}
            (AsyncStep::Open { ignore_errors: true }, Err(err)) => {
                warn!(connection = %self.connection_id, error = %err, "opening connection failed, ignoring");
            }
            (AsyncStep::Open { ignore_errors: false }, Err(err)) => {
                warn!(connection = %self.connection_id, error = %err, "opening connection failed");
                staged.fail(err);
                return Ok(());
            }
            (AsyncStep::Close, Err(err)) => {
                warn!(connection = %self.connection_id, error = %err, "closing connection failed, stopping client instances anyway");
                self.stop_client_actors().await;
                staged.fail(err);
                return Ok(());
            }
            (AsyncStep::Test, result) => {
                info!(connection = %self.connection_id, result = ?result, "connection test finished");
                self.stop_client_actors().await;
                staged.response = Some(result.map(ConnectivityResponse::Tested));
            }
        }
        if self.interpret(staged).await {
            ctx.stop();
        }
        Ok(())
    }
}

impl<F: DriverFactory> KameoMessage<CheckLoggingActive> for ConnectionSupervisor<F> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        _msg: CheckLoggingActive,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self
            .logging_enabled_until
            .is_some_and(|until| Utc::now() >= until)
        {
            info!(connection = %self.connection_id, "connection logging expired");
            self.disable_logging();
        }
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        let refs = pool.refs().clone();
        let timeout = self.config.client_actor_ask_timeout;
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            let activity = refs
                .collect(timeout, |actor| async move {
                    actor.ask(CheckLogsActive).await.map_err(send_failure)
                })
                .await;
            if activity.contains(&LoggingActivity::Expired) {
                let _ = actor_ref.tell(LoggingExpired).send().await;
            }
        });
        Ok(())
    }
}

impl<F: DriverFactory> KameoMessage<LoggingExpired> for ConnectionSupervisor<F> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        _msg: LoggingExpired,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(connection = %self.connection_id, "client instance reported expired logging");
        self.disable_logging();
        Ok(())
    }
}

impl<F: DriverFactory> KameoMessage<TriggerPriorityUpdate> for ConnectionSupervisor<F> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        _msg: TriggerPriorityUpdate,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let (Some(provider), Lifecycle::Created) = (self.priority_provider.clone(), self.lifecycle)
        else {
            return Ok(());
        };
        let correlation_id = format!("priority-update-{}", Uuid::new_v4());
        let lookup = provider.priority_for(&self.connection_id, &correlation_id);
        let actor_ref = self.actor_ref.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            match lookup.await {
                Ok(priority) => {
                    let _ = actor_ref
                        .tell(UpdatePriority {
                            priority,
                            correlation_id: Some(correlation_id),
                        })
                        .send()
                        .await;
                }
                Err(err) => {
                    warn!(connection = %connection_id, error = %err, "priority lookup failed")
                }
            }
        });
        Ok(())
    }
}

impl<F: DriverFactory> KameoMessage<UpdatePriority> for ConnectionSupervisor<F> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        msg: UpdatePriority,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.lifecycle != Lifecycle::Created || self.priority == Some(msg.priority) {
            return Ok(());
        }
        let previous = self.priority.replace(msg.priority);
        let event = ConnectivityEvent::Empty {
            effect: PRIORITY_UPDATE_EFFECT.to_string(),
        };
        let tags = journal_tags(self.priority);
        match self.persist_and_apply(event, msg.correlation_id, tags).await {
            Ok(()) => {
                info!(connection = %self.connection_id, priority = msg.priority, "connection priority updated")
            }
            Err(err) => {
                warn!(connection = %self.connection_id, error = %err, "persisting priority update failed");
                self.priority = previous;
            }
        }
        Ok(())
    }
}

impl<F: DriverFactory> KameoMessage<StartSearchSession> for ConnectionSupervisor<F> {
    type Reply = ConnectivityResult<String>;

    async fn handle(
        &mut self,
        msg: StartSearchSession,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let Some(pool) = &self.pool else {
            debug!(connection = %self.connection_id, "dropping search session, no client instances");
            return Err(ConnectivityError::ConnectionNotAccessible(
                self.connection_id.clone(),
            ));
        };
        let client_count = pool.client_count();
        let (index, prefix) = self.subscription_counter.next_prefix(client_count);
        let subscription_id = format!("{prefix}{}", Uuid::new_v4().simple());
        let target = if client_count == 1 {
            pool.route(&subscription_id)
        } else {
            pool.slot(index)
        };
        let Some(handle) = target else {
            debug!(connection = %self.connection_id, index, "dropping search session, no client at index");
            return Err(ConnectivityError::ConnectionNotAccessible(
                self.connection_id.clone(),
            ));
        };
        let command = SearchCommand::CreateSubscription {
            subscription_id: subscription_id.clone(),
            filter: msg.filter,
        };
        handle
            .actor
            .tell(ForwardSearchCommand(command))
            .send()
            .await
            .map_err(|_| ConnectivityError::Actor(format!("client instance {} is gone", handle.client_id)))?;
        Ok(subscription_id)
    }
}

impl<F: DriverFactory> KameoMessage<ForwardSearch> for ConnectionSupervisor<F> {
    type Reply = ConnectivityResult<()>;

    async fn handle(
        &mut self,
        ForwardSearch(command): ForwardSearch,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let target = self
            .pool
            .as_ref()
            .and_then(|pool| pool.route(command.subscription_id()))
            .cloned();
        match target {
            Some(handle) => {
                if handle.actor.tell(ForwardSearchCommand(command)).send().await.is_err() {
                    debug!(connection = %self.connection_id, client = %handle.client_id, "client gone, dropping search command");
                }
            }
            None => debug!(
                connection = %self.connection_id,
                subscription = command.subscription_id(),
                "no client instance for subscription, dropping search command"
            ),
        }
        Ok(())
    }
}

impl<F: DriverFactory> KameoMessage<GetSupervisorSnapshot> for ConnectionSupervisor<F> {
    type Reply = ConnectivityResult<SupervisorSnapshot>;

    async fn handle(
        &mut self,
        _msg: GetSupervisorSnapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.snapshot())
    }
}
