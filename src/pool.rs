//! Client instances of one connection and the routing between them.
//!
//! A connection runs `client_count` instances. Management fan-outs reach all of them; search
//! sessions stick to one instance, chosen from the hex prefix the supervisor puts in front of
//! every subscription id it hands out.

use std::future::Future;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use kameo::actor::ActorId;
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef, Message as KameoMessage};
use tracing::{debug, info, warn};
use twox_hash::XxHash64;
use uuid::Uuid;

use crate::client::{
    ClientActor, ClientActorArgs, ClientEnvironment, CloseConnection, OpenConnection, ReplyTo,
    TestConnection, UpdateSiblings,
};
use crate::core::{
    Connection, ConnectionLoggerRegistry, ConnectionMetricsRegistry, ConnectivityError,
    ConnectivityResult, StatusReply,
};
use crate::driver::{ClientDriver, DriverContext, DriverFactory};

/// Number of hex digits needed to address `client_count` instances.
pub fn subscription_prefix_len(client_count: usize) -> usize {
    format!("{:X}", client_count.saturating_sub(1)).len()
}

/// Instance index encoded in the prefix of `subscription_id`, if it addresses one of
/// `client_count` instances.
pub fn prefix_index(subscription_id: &str, client_count: usize) -> Option<usize> {
    let width = subscription_prefix_len(client_count);
    let prefix = subscription_id.get(..width)?;
    usize::from_str_radix(prefix, 16)
        .ok()
        .filter(|index| *index < client_count)
}

/// Round-robin source of subscription prefixes.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionCounter {
    next: usize,
}

impl SubscriptionCounter {
    /// Returns the current index and its fixed-width uppercase hex prefix, then advances.
    pub fn next_prefix(&mut self, client_count: usize) -> (usize, String) {
        let client_count = client_count.max(1);
        let index = self.next % client_count;
        self.next = (index + 1) % client_count;
        let width = subscription_prefix_len(client_count);
        (index, format!("{index:0width$X}"))
    }
}

pub(crate) fn hash64(bytes: impl AsRef<[u8]>) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes.as_ref());
    hasher.finish()
}

/// Jump-consistent hash of `key` onto `buckets` buckets.
pub fn jump_consistent_hash(key: u64, buckets: u64) -> u64 {
    if buckets == 0 {
        return 0;
    }
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    let mut k = key;
    while j < buckets as i64 {
        b = j;
        k = k.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = (((b + 1) as f64) * (1u64 << 31) as f64 / (((k >> 33) + 1) as f64)).floor() as i64;
    }
    b as u64
}

/// Command of a streaming search session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCommand {
    CreateSubscription {
        subscription_id: String,
        filter: Option<String>,
    },
    RequestFromSubscription {
        subscription_id: String,
        demand: u64,
    },
    CancelSubscription {
        subscription_id: String,
    },
}

impl SearchCommand {
    pub fn subscription_id(&self) -> &str {
        match self {
            Self::CreateSubscription {
                subscription_id, ..
            }
            | Self::RequestFromSubscription {
                subscription_id, ..
            }
            | Self::CancelSubscription { subscription_id } => subscription_id,
        }
    }
}

/// Serves search sessions that were routed to a connected client instance.
pub trait SearchSessionHandler: Send + Sync + 'static {
    fn handle(&self, client_id: &str, command: SearchCommand);
}

/// One running client instance.
pub struct ClientHandle<D: ClientDriver> {
    pub client_id: String,
    pub actor: ActorRef<ClientActor<D>>,
}

impl<D: ClientDriver> Clone for ClientHandle<D> {
    fn clone(&self) -> Self {
        Self {
            client_id: self.client_id.clone(),
            actor: self.actor.clone(),
        }
    }
}

/// Client instances of a connection, ordered by client id.
///
/// Every instance and the supervisor hold the same ordering, so a prefix index means the same
/// instance everywhere.
pub struct ClientActorRefs<D: ClientDriver> {
    handles: Vec<ClientHandle<D>>,
}

impl<D: ClientDriver> Clone for ClientActorRefs<D> {
    fn clone(&self) -> Self {
        Self {
            handles: self.handles.clone(),
        }
    }
}

impl<D: ClientDriver> Default for ClientActorRefs<D> {
    fn default() -> Self {
        Self {
            handles: Vec::new(),
        }
    }
}

impl<D: ClientDriver> ClientActorRefs<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: ClientHandle<D>) {
        self.handles.retain(|h| h.client_id != handle.client_id);
        let at = self
            .handles
            .partition_point(|h| h.client_id < handle.client_id);
        self.handles.insert(at, handle);
    }

    pub fn remove(&mut self, id: ActorId) -> Option<ClientHandle<D>> {
        let at = self.handles.iter().position(|h| h.actor.id() == id)?;
        Some(self.handles.remove(at))
    }

    pub fn get(&self, index: usize) -> Option<&ClientHandle<D>> {
        self.handles.get(index)
    }

    pub fn position(&self, client_id: &str) -> Option<usize> {
        self.handles.iter().position(|h| h.client_id == client_id)
    }

    pub fn contains(&self, id: ActorId) -> bool {
        self.handles.iter().any(|h| h.actor.id() == id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientHandle<D>> {
        self.handles.iter()
    }

    /// Instance serving `subscription_id`.
    ///
    /// A single-instance connection hashes the id; otherwise the prefix selects the instance.
    pub fn route(&self, subscription_id: &str, client_count: usize) -> Option<&ClientHandle<D>> {
        if client_count <= 1 {
            let bucket = jump_consistent_hash(hash64(subscription_id), self.len() as u64);
            return self.get(bucket as usize);
        }
        prefix_index(subscription_id, client_count).and_then(|index| self.get(index))
    }

    /// Ask every instance concurrently; replies that fail or miss `timeout` are left out.
    pub async fn collect<R, F, Fut>(&self, timeout: Duration, ask: F) -> Vec<R>
    where
        F: Fn(ActorRef<ClientActor<D>>) -> Fut,
        Fut: Future<Output = ConnectivityResult<R>>,
    {
        let asks = self.handles.iter().map(|handle| {
            let reply = ask(handle.actor.clone());
            let client_id = handle.client_id.clone();
            async move {
                match tokio::time::timeout(timeout, reply).await {
                    Ok(Ok(value)) => Some(value),
                    Ok(Err(err)) => {
                        warn!(client = %client_id, error = %err, "client instance query failed");
                        None
                    }
                    Err(_) => {
                        warn!(client = %client_id, ?timeout, "client instance query timed out");
                        None
                    }
                }
            }
        });
        join_all(asks).await.into_iter().flatten().collect()
    }

    /// Send a delegated status request to every instance; the first failure wins.
    pub async fn broadcast_status<F, M>(&self, timeout: Duration, make: F) -> StatusReply
    where
        F: Fn(ReplyTo) -> M,
        M: Send + 'static,
        ClientActor<D>: KameoMessage<M, Reply = ConnectivityResult<()>>,
    {
        let asks = self.handles.iter().map(|handle| {
            let reply = ask_status(&handle.actor, &make);
            async move {
                tokio::time::timeout(timeout, reply)
                    .await
                    .unwrap_or_else(|_| {
                        Err(ConnectivityError::Timeout {
                            context: format!("waiting for client instance {}", handle.client_id),
                        })
                    })
            }
        });
        let mut last = Ok(String::new());
        for reply in join_all(asks).await {
            match reply {
                Ok(message) => last = Ok(message),
                Err(err) => return Err(err),
            }
        }
        last
    }

    pub async fn open_all(&self, timeout: Duration) -> StatusReply {
        self.broadcast_status(timeout, |reply| OpenConnection::replying(reply))
            .await
    }

    pub async fn close_all(&self, timeout: Duration) -> StatusReply {
        self.broadcast_status(timeout, |reply| CloseConnection::replying(reply))
            .await
    }

    /// Run a connection test on the first instance.
    pub async fn test_first(&self, timeout: Duration) -> StatusReply {
        let Some(handle) = self.get(0) else {
            return Err(ConnectivityError::Actor(
                "no client instance to test with".to_string(),
            ));
        };
        tokio::time::timeout(timeout, ask_status(&handle.actor, TestConnection::replying))
            .await
            .unwrap_or_else(|_| {
                Err(ConnectivityError::Timeout {
                    context: format!("testing through client instance {}", handle.client_id),
                })
            })
    }

    /// Fire-and-forget `make()` to every instance.
    pub async fn tell_all<F, M>(&self, make: F)
    where
        F: Fn() -> M,
        M: Send + 'static,
        ClientActor<D>: KameoMessage<M, Reply = ConnectivityResult<()>>,
    {
        for handle in &self.handles {
            if let Err(err) = handle.actor.tell(make()).send().await {
                debug!(client = %handle.client_id, error = %send_failure(err.map_err(|e| match e {})), "dropping broadcast");
            }
        }
    }
}

/// Map a kameo send failure onto the connectivity error surface.
pub fn send_failure<M>(err: SendError<M, ConnectivityError>) -> ConnectivityError {
    match err {
        SendError::HandlerError(err) => err,
        SendError::ActorStopped => ConnectivityError::Actor("client instance stopped".to_string()),
        _ => ConnectivityError::Actor("client instance not reachable".to_string()),
    }
}

/// Tell `actor` a message carrying a reply channel and wait for the answer.
pub async fn ask_status<A, M, F>(actor: &ActorRef<A>, make: F) -> StatusReply
where
    A: Actor + KameoMessage<M, Reply = ConnectivityResult<()>>,
    M: Send + 'static,
    F: FnOnce(ReplyTo) -> M,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    actor.tell(make(tx)).send().await.map_err(|err| send_failure(err.map_err(|e| match e {})))?;
    rx.await
        .unwrap_or_else(|_| Err(ConnectivityError::Actor("client instance dropped the request".to_string())))
}

/// Static inputs of a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub client_count: usize,
    pub dry_run: bool,
    pub ask_timeout: Duration,
    pub success_log_capacity: usize,
    pub failure_log_capacity: usize,
}

/// Running client instances of one connection, linked to their supervisor.
pub struct ClientPool<D: ClientDriver> {
    connection_id: String,
    refs: ClientActorRefs<D>,
    /// Client ids in routing order as started. An instance that stops keeps its slot.
    slots: Vec<String>,
    ask_timeout: Duration,
}

impl<D: ClientDriver> ClientPool<D> {
    /// Spawn `client_count` instances and link each one to `supervisor`.
    ///
    /// When a driver cannot be created, the instances spawned so far are stopped again.
    pub async fn start<F, S>(
        connection: Arc<Connection>,
        settings: PoolSettings,
        factory: &F,
        env: &ClientEnvironment,
        supervisor: &ActorRef<S>,
    ) -> ConnectivityResult<Self>
    where
        F: DriverFactory<Driver = D>,
        S: Actor,
    {
        let client_count = settings.client_count.max(1);
        let mut pool = Self {
            connection_id: connection.id.clone(),
            refs: ClientActorRefs::new(),
            slots: Vec::with_capacity(client_count),
            ask_timeout: settings.ask_timeout,
        };
        for _ in 0..client_count {
            let client_id = if client_count == 1 {
                connection.id.clone()
            } else {
                format!("{}_{}", connection.id, Uuid::new_v4().simple())
            };
            let metrics = ConnectionMetricsRegistry::new();
            let logs = Arc::new(ConnectionLoggerRegistry::new(
                settings.success_log_capacity,
                settings.failure_log_capacity,
            ));
            let context = DriverContext {
                client_id: client_id.clone(),
                metrics: metrics.clone(),
                logs: logs.clone(),
            };
            let driver = match factory.create(&connection, context) {
                Ok(driver) => driver,
                Err(err) => {
                    warn!(connection = %connection.id, error = %err, "driver creation failed");
                    pool.stop().await;
                    return Err(err);
                }
            };
            let actor = ClientActor::spawn(ClientActorArgs {
                connection: connection.clone(),
                client_id: client_id.clone(),
                driver,
                env: env.clone(),
                metrics,
                logs,
                dry_run: settings.dry_run,
            });
            actor.link(supervisor).await;
            pool.refs.insert(ClientHandle { client_id, actor });
        }
        pool.slots = pool.refs.iter().map(|h| h.client_id.clone()).collect();
        info!(
            connection = %pool.connection_id,
            clients = pool.refs.len(),
            dry_run = settings.dry_run,
            "started client instances"
        );
        let siblings = pool.refs.clone();
        pool.refs
            .tell_all(|| UpdateSiblings::new(siblings.clone()))
            .await;
        Ok(pool)
    }

    pub fn refs(&self) -> &ClientActorRefs<D> {
        &self.refs
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Number of instances the pool was started with, the modulus of subscription routing.
    pub fn client_count(&self) -> usize {
        self.slots.len()
    }

    /// Running instance in routing slot `index`.
    pub fn slot(&self, index: usize) -> Option<&ClientHandle<D>> {
        let client_id = self.slots.get(index)?;
        self.refs.position(client_id).and_then(|at| self.refs.get(at))
    }

    /// Running instance serving `subscription_id`.
    pub fn route(&self, subscription_id: &str) -> Option<&ClientHandle<D>> {
        let client_count = self.client_count();
        if client_count <= 1 {
            return self.refs.route(subscription_id, client_count);
        }
        prefix_index(subscription_id, client_count).and_then(|index| self.slot(index))
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn contains(&self, id: ActorId) -> bool {
        self.refs.contains(id)
    }

    /// Forget an instance that stopped on its own.
    pub fn forget(&mut self, id: ActorId) -> Option<ClientHandle<D>> {
        self.refs.remove(id)
    }

    pub async fn open(&self) -> StatusReply {
        self.refs.open_all(self.ask_timeout).await
    }

    pub async fn close(&self) -> StatusReply {
        self.refs.close_all(self.ask_timeout).await
    }

    /// Test through the first instance.
    pub async fn test(&self) -> StatusReply {
        self.refs.test_first(self.ask_timeout).await
    }

    /// Stop every instance and wait until they are gone.
    pub async fn stop(&mut self) {
        let handles = std::mem::take(&mut self.refs);
        for handle in handles.iter() {
            let _ = handle.actor.stop_gracefully().await;
        }
        for handle in handles.iter() {
            handle.actor.wait_for_shutdown().await;
        }
        debug!(connection = %self.connection_id, stopped = handles.len(), "stopped client instances");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::core::{ConnectionType, ConnectivityStatus};
    use crate::pubsub::InMemoryBus;
    use crate::testing::{MockDriver, MockDriverControl, MockDriverFactory};

    #[test]
    fn prefix_width_covers_highest_index() {
        assert_eq!(subscription_prefix_len(1), 1);
        assert_eq!(subscription_prefix_len(16), 1);
        assert_eq!(subscription_prefix_len(17), 2);
        assert_eq!(subscription_prefix_len(256), 2);
        assert_eq!(subscription_prefix_len(257), 3);
    }

    #[test]
    fn counter_starts_at_zero_and_wraps() {
        let mut counter = SubscriptionCounter::default();
        let prefixes: Vec<String> = (0..4).map(|_| counter.next_prefix(3).1).collect();
        assert_eq!(prefixes, vec!["0", "1", "2", "0"]);

        let mut counter = SubscriptionCounter::default();
        for _ in 0..10 {
            counter.next_prefix(17);
        }
        assert_eq!(counter.next_prefix(17), (10, "0A".to_string()));
    }

    #[test]
    fn prefix_selects_instance_index() {
        assert_eq!(prefix_index("0Aabc", 17), Some(10));
        assert_eq!(prefix_index("2abc", 3), Some(2));
        assert_eq!(prefix_index("3abc", 3), None);
        assert_eq!(prefix_index("zz", 3), None);
        assert_eq!(prefix_index("", 3), None);
    }

    #[test]
    fn prefixes_round_trip_through_index() {
        for client_count in [2usize, 5, 16, 17, 40] {
            let mut counter = SubscriptionCounter::default();
            for _ in 0..client_count * 2 {
                let (index, prefix) = counter.next_prefix(client_count);
                let subscription_id = format!("{prefix}{}", Uuid::new_v4().simple());
                assert_eq!(prefix_index(&subscription_id, client_count), Some(index));
            }
        }
    }

    struct Parent;

    impl Actor for Parent {
        type Args = ();
        type Error = ConnectivityError;

        fn name() -> &'static str {
            "Parent"
        }

        async fn on_start(_args: (), _actor_ref: ActorRef<Self>) -> ConnectivityResult<Self> {
            Ok(Parent)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_instance_keeps_its_routing_slot() {
        let parent = Parent::spawn(());
        let connection = Arc::new(
            Connection::new(
                "route",
                ConnectionType::Kafka,
                "tcp://kafka.local:9092",
                ConnectivityStatus::Closed,
            )
            .with_client_count(4),
        );
        let factory = MockDriverFactory::new(MockDriverControl::new());
        let env = ClientEnvironment::new(ClientConfig::default(), Arc::new(InMemoryBus::new()));
        let settings = PoolSettings {
            client_count: 4,
            dry_run: false,
            ask_timeout: Duration::from_secs(5),
            success_log_capacity: 10,
            failure_log_capacity: 10,
        };
        let mut pool = ClientPool::start(connection, settings, &*factory, &env, &parent)
            .await
            .expect("pool");
        let ids: Vec<String> = pool.refs().iter().map(|h| h.client_id.clone()).collect();
        let served_by = |pool: &ClientPool<MockDriver>, subscription_id: &str| {
            pool.route(subscription_id).map(|h| h.client_id.clone())
        };
        assert_eq!(served_by(&pool, "3abc"), Some(ids[3].clone()));

        let stopped = pool.slot(1).expect("slot 1").actor.clone();
        let _ = stopped.stop_gracefully().await;
        stopped.wait_for_shutdown().await;
        pool.forget(stopped.id());

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.client_count(), 4);
        assert!(pool.slot(1).is_none());
        assert_eq!(served_by(&pool, "1abc"), None);
        assert_eq!(served_by(&pool, "2abc"), Some(ids[2].clone()));
        assert_eq!(served_by(&pool, "3abc"), Some(ids[3].clone()));

        pool.stop().await;
        let _ = parent.stop_gracefully().await;
        parent.wait_for_shutdown().await;
    }

    #[test]
    fn jump_hash_is_stable_and_in_range() {
        let key = hash64("subscription-1");
        assert_eq!(jump_consistent_hash(key, 1), 0);
        assert_eq!(jump_consistent_hash(key, 0), 0);
        let bucket = jump_consistent_hash(key, 8);
        assert!(bucket < 8);
        assert_eq!(jump_consistent_hash(key, 8), bucket);
    }
}
