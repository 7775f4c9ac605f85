//! Event journal the supervisor persists to and recovers from.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use tracing::debug;

use super::events::JournalEntry;
use crate::core::{ConnectivityError, ConnectivityResult};

pub type JournalFuture<T> = Pin<Box<dyn Future<Output = ConnectivityResult<T>> + Send + 'static>>;

/// Append-only event log, one stream per connection id.
pub trait EventJournal: Send + Sync + 'static {
    /// Append `entry`; its revision must directly follow the stream's last revision.
    fn append(&self, entry: JournalEntry) -> JournalFuture<()>;

    /// Every entry of `connection_id` in revision order.
    fn replay(&self, connection_id: &str) -> JournalFuture<Vec<JournalEntry>>;
}

#[derive(Debug, Default)]
pub struct InMemoryJournal {
    streams: Mutex<HashMap<String, Vec<JournalEntry>>>,
    failing: AtomicBool,
}

impl InMemoryJournal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Vec<JournalEntry>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following append fail, or succeed again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries_of(&self, connection_id: &str) -> Vec<JournalEntry> {
        self.streams()
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl EventJournal for InMemoryJournal {
    fn append(&self, entry: JournalEntry) -> JournalFuture<()> {
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(ConnectivityError::Persistence(format!(
                "journal rejected {} of connection '{}'",
                entry.event.name(),
                entry.connection_id
            )))
        } else {
            let mut streams = self.streams();
            let stream = streams.entry(entry.connection_id.clone()).or_default();
            let expected = stream.last().map_or(1, |last| last.revision + 1);
            if entry.revision == expected {
                debug!(
                    connection = %entry.connection_id,
                    revision = entry.revision,
                    event = entry.event.name(),
                    "journal append"
                );
                stream.push(entry);
                Ok(())
            } else {
                Err(ConnectivityError::Persistence(format!(
                    "revision {} of connection '{}' does not follow {}",
                    entry.revision,
                    entry.connection_id,
                    expected - 1
                )))
            }
        };
        Box::pin(async move { result })
    }

    fn replay(&self, connection_id: &str) -> JournalFuture<Vec<JournalEntry>> {
        let entries = self.entries_of(connection_id);
        Box::pin(async move { Ok(entries) })
    }
}
