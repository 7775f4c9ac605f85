//! Reusable test utilities for driving client instances and supervisors without a real broker.
//!
//! [`MockDriverFactory`] hands out [`MockDriver`]s that all share one [`MockDriverControl`], so a
//! test can flip failure switches, inject driver events and count calls across every instance of
//! a connection.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::core::{
    ClientObserver, ClientState, Clock, Connection, ConnectivityError, ConnectivityResult,
    ConnectivityStatus, StreamingType,
};
use crate::driver::{
    ChildKind, ClientDriver, ConnectionAnnouncement, DriverContext, DriverEvent, DriverEvents,
    DriverFactory, DriverFuture,
};
use crate::pool::{SearchCommand, SearchSessionHandler};
use crate::pubsub::{BusFuture, BusTerminated, InMemoryBus, MessageBus};
use crate::supervisor::{PriorityFuture, PriorityProvider};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Switches and counters shared by every [`MockDriver`] of a factory.
#[derive(Debug, Default)]
pub struct MockDriverControl {
    fail_connect: AtomicBool,
    fail_probe: AtomicBool,
    fail_publisher: AtomicBool,
    fail_consumers: AtomicBool,
    fail_test: AtomicBool,
    connect_delay: Mutex<Duration>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    cleanup_calls: AtomicUsize,
    child_stops: AtomicUsize,
    child_restarts: AtomicUsize,
    test_calls: AtomicUsize,
    consumer_starts: AtomicUsize,
    announcements: Mutex<Vec<ConnectionAnnouncement>>,
    protocol_errors: Mutex<Vec<String>>,
    events: Mutex<Vec<DriverEvents>>,
}

impl MockDriverControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publisher(&self, fail: bool) {
        self.fail_publisher.store(fail, Ordering::SeqCst);
    }

    pub fn fail_consumers(&self, fail: bool) {
        self.fail_consumers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_test(&self, fail: bool) {
        self.fail_test.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = delay;
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    /// Helpers actually stopped; repeated cleanups of released resources do not count.
    pub fn child_stops(&self) -> usize {
        self.child_stops.load(Ordering::SeqCst)
    }

    pub fn child_restarts(&self) -> usize {
        self.child_restarts.load(Ordering::SeqCst)
    }

    pub fn test_calls(&self) -> usize {
        self.test_calls.load(Ordering::SeqCst)
    }

    pub fn consumer_starts(&self) -> usize {
        self.consumer_starts.load(Ordering::SeqCst)
    }

    pub fn announcements(&self) -> Vec<ConnectionAnnouncement> {
        lock(&self.announcements).clone()
    }

    pub fn protocol_errors(&self) -> Vec<String> {
        lock(&self.protocol_errors).clone()
    }

    /// Raise `event` on every bound instance; returns how many received it.
    pub fn emit(&self, event: DriverEvent) -> usize {
        let mut events = lock(&self.events);
        events.retain(|sink| sink.emit(event.clone()));
        events.len()
    }

    fn outcome(flag: &AtomicBool, context: &'static str) -> ConnectivityResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(ConnectivityError::driver(context, "mock failure"))
        } else {
            Ok(())
        }
    }
}

/// Driver whose behavior is scripted through a [`MockDriverControl`].
pub struct MockDriver {
    client_id: String,
    control: Arc<MockDriverControl>,
    allocated: bool,
}

impl MockDriver {
    pub fn new(client_id: impl Into<String>, control: Arc<MockDriverControl>) -> Self {
        Self {
            client_id: client_id.into(),
            control,
            allocated: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl ClientDriver for MockDriver {
    fn bind(&mut self, events: DriverEvents) {
        lock(&self.control.events).push(events);
    }

    fn probe(&self, host: String, port: u16, _timeout: Duration) -> DriverFuture<()> {
        let failed = self.control.fail_probe.load(Ordering::SeqCst);
        Box::pin(async move {
            if failed {
                Err(ConnectivityError::driver(
                    "probe",
                    format!("{host}:{port} unreachable"),
                ))
            } else {
                Ok(())
            }
        })
    }

    fn connect(&self) -> DriverFuture<()> {
        let control = self.control.clone();
        control.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&control.connect_delay);
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            MockDriverControl::outcome(&control.fail_connect, "connect")
        })
    }

    fn disconnect(&self) -> DriverFuture<()> {
        self.control.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn test_connection(&self, connection: Arc<Connection>) -> DriverFuture<String> {
        let control = self.control.clone();
        control.test_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            MockDriverControl::outcome(&control.fail_test, "test")?;
            Ok(format!("connection {} reachable", connection.id))
        })
    }

    fn allocate_resources(&mut self) {
        self.allocated = true;
    }

    fn start_publisher(&self) -> DriverFuture<()> {
        let result = MockDriverControl::outcome(&self.control.fail_publisher, "publisher");
        Box::pin(async move { result })
    }

    fn start_consumers(&self) -> DriverFuture<()> {
        self.control.consumer_starts.fetch_add(1, Ordering::SeqCst);
        let result = MockDriverControl::outcome(&self.control.fail_consumers, "consumers");
        Box::pin(async move { result })
    }

    fn cleanup_resources(&mut self) {
        self.control.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        if std::mem::take(&mut self.allocated) {
            self.control.child_stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn send_announcement(&self, announcement: ConnectionAnnouncement) -> DriverFuture<()> {
        lock(&self.control.announcements).push(announcement);
        Box::pin(async { Ok(()) })
    }

    fn start_tunnel(&self) -> DriverFuture<u16> {
        Box::pin(async { Ok(2222) })
    }

    fn forward_protocol_error(&self, error: String) {
        lock(&self.control.protocol_errors).push(error);
    }

    fn stop_child(&mut self, _child: &ChildKind) {
        self.control.child_stops.fetch_add(1, Ordering::SeqCst);
    }

    fn restart_child(&mut self, _child: &ChildKind) {
        self.control.child_restarts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory producing [`MockDriver`]s bound to one control.
#[derive(Debug, Default)]
pub struct MockDriverFactory {
    control: Arc<MockDriverControl>,
    created: AtomicUsize,
    fail_create: AtomicBool,
}

impl MockDriverFactory {
    pub fn new(control: Arc<MockDriverControl>) -> Arc<Self> {
        Arc::new(Self {
            control,
            created: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
        })
    }

    pub fn control(&self) -> &Arc<MockDriverControl> {
        &self.control
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

impl DriverFactory for MockDriverFactory {
    type Driver = MockDriver;

    fn create(
        &self,
        connection: &Connection,
        context: DriverContext,
    ) -> ConnectivityResult<Self::Driver> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ConnectivityError::Misconfigured {
                id: connection.id.clone(),
                description: "mock driver creation failed".to_string(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockDriver::new(context.client_id, self.control.clone()))
    }
}

/// Records every state transition and status change of every instance.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    transitions: Mutex<Vec<(String, ClientState, ClientState)>>,
    statuses: Mutex<Vec<(String, ConnectivityStatus)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transitions(&self) -> Vec<(String, ClientState, ClientState)> {
        lock(&self.transitions).clone()
    }

    /// States `client_id` entered, in order.
    pub fn states_of(&self, client_id: &str) -> Vec<ClientState> {
        lock(&self.transitions)
            .iter()
            .filter(|(id, _, _)| id == client_id)
            .map(|(_, _, to)| *to)
            .collect()
    }

    pub fn statuses_of(&self, client_id: &str) -> Vec<ConnectivityStatus> {
        lock(&self.statuses)
            .iter()
            .filter(|(id, _)| id == client_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

impl ClientObserver for RecordingObserver {
    fn on_transition(&self, client_id: &str, from: ClientState, to: ClientState) {
        lock(&self.transitions).push((client_id.to_string(), from, to));
    }

    fn on_status(&self, client_id: &str, status: ConnectivityStatus, _details: &str) {
        lock(&self.statuses).push((client_id.to_string(), status));
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

/// Search handler that remembers which instance served which command.
#[derive(Debug, Default)]
pub struct RecordingSearchHandler {
    handled: Mutex<Vec<(String, SearchCommand)>>,
}

impl RecordingSearchHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handled(&self) -> Vec<(String, SearchCommand)> {
        lock(&self.handled).clone()
    }

    /// Instances that served `subscription_id`.
    pub fn served_by(&self, subscription_id: &str) -> Vec<String> {
        lock(&self.handled)
            .iter()
            .filter(|(_, command)| command.subscription_id() == subscription_id)
            .map(|(client_id, _)| client_id.clone())
            .collect()
    }
}

impl SearchSessionHandler for RecordingSearchHandler {
    fn handle(&self, client_id: &str, command: SearchCommand) {
        lock(&self.handled).push((client_id.to_string(), command));
    }
}

/// Priority source returning a settable value.
#[derive(Debug, Default)]
pub struct StaticPriorityProvider {
    priority: AtomicI32,
    lookups: AtomicUsize,
}

impl StaticPriorityProvider {
    pub fn new(priority: i32) -> Arc<Self> {
        Arc::new(Self {
            priority: AtomicI32::new(priority),
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl PriorityProvider for StaticPriorityProvider {
    fn priority_for(&self, _connection_id: &str, _correlation_id: &str) -> PriorityFuture {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let priority = self.priority.load(Ordering::SeqCst);
        Box::pin(async move { Ok(priority) })
    }
}

/// [`InMemoryBus`] that remembers every subscribe and label declaration it was asked for.
#[derive(Debug, Default)]
pub struct RecordingBus {
    inner: InMemoryBus,
    subscribed: Mutex<Vec<String>>,
    declared: Mutex<Vec<String>>,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inner(&self) -> &InMemoryBus {
        &self.inner
    }

    /// Subscribers in the order their subscriptions were requested.
    pub fn subscribed(&self) -> Vec<String> {
        lock(&self.subscribed).clone()
    }

    pub fn declared(&self) -> Vec<String> {
        lock(&self.declared).clone()
    }
}

impl MessageBus for RecordingBus {
    fn subscribe(
        &self,
        subscriber: &str,
        types: BTreeSet<StreamingType>,
        fatal: tokio::sync::mpsc::UnboundedSender<BusTerminated>,
    ) -> BusFuture<()> {
        lock(&self.subscribed).push(subscriber.to_string());
        self.inner.subscribe(subscriber, types, fatal)
    }

    fn remove_subscriber(&self, subscriber: &str) {
        self.inner.remove_subscriber(subscriber);
    }

    fn declare_ack_labels(
        &self,
        group: &str,
        subscriber: &str,
        labels: BTreeSet<String>,
    ) -> BusFuture<()> {
        lock(&self.declared).push(subscriber.to_string());
        self.inner.declare_ack_labels(group, subscriber, labels)
    }
}
