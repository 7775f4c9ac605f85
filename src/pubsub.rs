//! Cluster-wide publish/subscribe seam.
//!
//! Client instances subscribe to the streaming types their targets publish and declare the
//! acknowledgement labels their targets issue. Subscribe and unsubscribe are idempotent.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{ConnectivityError, ConnectivityResult, StreamingType};

pub type BusFuture<T> = Pin<Box<dyn Future<Output = ConnectivityResult<T>> + Send + 'static>>;

/// Fatal failure of the bus infrastructure, delivered to each affected subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusTerminated {
    pub reason: String,
}

pub trait MessageBus: Send + Sync + 'static {
    /// Subscribe `subscriber` to `types`; fatal bus failures are delivered to `fatal`.
    fn subscribe(
        &self,
        subscriber: &str,
        types: BTreeSet<StreamingType>,
        fatal: mpsc::UnboundedSender<BusTerminated>,
    ) -> BusFuture<()>;

    fn remove_subscriber(&self, subscriber: &str);

    /// Declare acknowledgement labels for `group`; labels owned by another group are rejected.
    fn declare_ack_labels(
        &self,
        group: &str,
        subscriber: &str,
        labels: BTreeSet<String>,
    ) -> BusFuture<()>;
}

#[derive(Debug, Default)]
struct BusState {
    subscriptions: HashMap<String, (BTreeSet<StreamingType>, mpsc::UnboundedSender<BusTerminated>)>,
    ack_labels: HashMap<String, (String, BTreeSet<String>)>,
}

/// Single-process bus for tests and embedded deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribers_of(&self, streaming_type: StreamingType) -> Vec<String> {
        let mut subscribers: Vec<String> = self
            .state()
            .subscriptions
            .iter()
            .filter(|(_, (types, _))| types.contains(&streaming_type))
            .map(|(subscriber, _)| subscriber.clone())
            .collect();
        subscribers.sort();
        subscribers
    }

    pub fn is_subscribed(&self, subscriber: &str) -> bool {
        self.state().subscriptions.contains_key(subscriber)
    }

    pub fn label_owner(&self, label: &str) -> Option<String> {
        self.state()
            .ack_labels
            .get(label)
            .map(|(group, _)| group.clone())
    }

    /// Simulate a fatal infrastructure failure: every subscriber is notified and dropped.
    pub fn terminate(&self, reason: &str) {
        let subscriptions = std::mem::take(&mut self.state().subscriptions);
        for (subscriber, (_, fatal)) in subscriptions {
            debug!(subscriber = %subscriber, reason, "notifying subscriber of bus termination");
            let _ = fatal.send(BusTerminated {
                reason: reason.to_string(),
            });
        }
    }
}

impl MessageBus for InMemoryBus {
    fn subscribe(
        &self,
        subscriber: &str,
        types: BTreeSet<StreamingType>,
        fatal: mpsc::UnboundedSender<BusTerminated>,
    ) -> BusFuture<()> {
        self.state()
            .subscriptions
            .insert(subscriber.to_string(), (types, fatal));
        Box::pin(async { Ok(()) })
    }

    fn remove_subscriber(&self, subscriber: &str) {
        let mut state = self.state();
        state.subscriptions.remove(subscriber);
        for (_, subscribers) in state.ack_labels.values_mut() {
            subscribers.remove(subscriber);
        }
        state
            .ack_labels
            .retain(|_, (_, subscribers)| !subscribers.is_empty());
    }

    fn declare_ack_labels(
        &self,
        group: &str,
        subscriber: &str,
        labels: BTreeSet<String>,
    ) -> BusFuture<()> {
        let result = {
            let mut state = self.state();
            let conflict = labels.iter().find(|label| {
                state
                    .ack_labels
                    .get(*label)
                    .is_some_and(|(owner, _)| owner != group)
            })
            .cloned();
            match conflict {
                Some(label) => Err(ConnectivityError::PubSub(format!(
                    "Acknowledgement label '{label}' is already declared by another connection"
                ))),
                None => {
                    for label in labels {
                        state
                            .ack_labels
                            .entry(label)
                            .or_insert_with(|| (group.to_string(), BTreeSet::new()))
                            .1
                            .insert(subscriber.to_string());
                    }
                    Ok(())
                }
            }
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribe_is_idempotent_and_removable() {
        let bus = InMemoryBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let types: BTreeSet<_> = [StreamingType::Events].into_iter().collect();
        bus.subscribe("client-a", types.clone(), tx.clone())
            .await
            .expect("subscribe");
        bus.subscribe("client-a", types, tx).await.expect("subscribe");
        assert_eq!(bus.subscribers_of(StreamingType::Events), vec!["client-a"]);

        bus.remove_subscriber("client-a");
        bus.remove_subscriber("client-a");
        assert!(bus.subscribers_of(StreamingType::Events).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ack_labels_conflict_across_groups() {
        let bus = InMemoryBus::new();
        bus.declare_ack_labels("conn-1", "a", labels(&["custom:ack"]))
            .await
            .expect("first declaration");
        bus.declare_ack_labels("conn-1", "b", labels(&["custom:ack"]))
            .await
            .expect("same group may share");
        let err = bus
            .declare_ack_labels("conn-2", "c", labels(&["custom:ack"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::PubSub(_)));

        bus.remove_subscriber("a");
        bus.remove_subscriber("b");
        assert_eq!(bus.label_owner("custom:ack"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_notifies_subscribers() {
        let bus = InMemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("a", BTreeSet::new(), tx).await.expect("subscribe");
        bus.terminate("cluster left");
        assert_eq!(
            rx.recv().await,
            Some(BusTerminated {
                reason: "cluster left".to_string()
            })
        );
        assert!(!bus.is_subscribed("a"));
    }
}
