//! Persistent connection supervisor and the command staging it interprets.

pub mod actor;
pub mod commands;
pub mod events;
pub mod journal;
pub mod priority;
pub mod staged;
pub mod strategies;

pub use actor::{
    ConnectionSupervisor, ExecuteCommand, ForwardSearch, GetSupervisorSnapshot,
    StartSearchSession, SupervisorArgs, SupervisorSnapshot, UpdatePriority, execute,
};
pub use commands::{
    ConnectionStatusReport, ConnectivityCommand, ConnectivityResponse, aggregate_live_status,
};
pub use events::{ConnectivityEvent, JournalEntry, journal_tags, priority_from_tags};
pub use journal::{EventJournal, InMemoryJournal, JournalFuture};
pub use priority::{PriorityFuture, PriorityProvider};
pub use staged::{ConnectionAction, StagedCommand};
pub use strategies::Lifecycle;
