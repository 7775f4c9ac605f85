//! Persisted events of a connection and the journal tags they carry.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    Connection, ConnectionLifecycle, ConnectivityError, ConnectivityResult, ConnectivityStatus,
};

/// Tag of connections the read side keeps alive.
pub const ALWAYS_ALIVE_TAG: &str = "always-alive";
pub const PRIORITY_TAG_PREFIX: &str = "priority:";
/// Effect of the empty event that only carries updated journal tags.
pub const PRIORITY_UPDATE_EFFECT: &str = "priority-update";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectivityEvent {
    Created { connection: Connection },
    Modified { connection: Connection },
    Opened,
    Closed,
    Deleted,
    Empty { effect: String },
}

impl ConnectivityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "ConnectionCreated",
            Self::Modified { .. } => "ConnectionModified",
            Self::Opened => "ConnectionOpened",
            Self::Closed => "ConnectionClosed",
            Self::Deleted => "ConnectionDeleted",
            Self::Empty { .. } => "EmptyEvent",
        }
    }

    /// Entity after this event.
    pub fn apply(&self, entity: Option<Connection>) -> Option<Connection> {
        match self {
            Self::Created { connection } | Self::Modified { connection } => {
                let mut connection = connection.clone();
                connection.lifecycle = Some(ConnectionLifecycle::Active);
                Some(connection)
            }
            Self::Opened => entity.map(|c| c.with_status(ConnectivityStatus::Open)),
            Self::Closed => entity.map(|c| c.with_status(ConnectivityStatus::Closed)),
            Self::Deleted => entity.map(|mut c| {
                c.connection_status = ConnectivityStatus::Closed;
                c.lifecycle = Some(ConnectionLifecycle::Deleted);
                c
            }),
            Self::Empty { .. } => entity,
        }
    }

    /// Desired status the connection has once this event is applied.
    pub fn target_status(&self, entity: Option<&Connection>) -> ConnectivityStatus {
        match self {
            Self::Created { connection } | Self::Modified { connection } => {
                connection.connection_status
            }
            Self::Opened => ConnectivityStatus::Open,
            Self::Closed | Self::Deleted => ConnectivityStatus::Closed,
            Self::Empty { .. } => entity
                .map(|c| c.connection_status)
                .unwrap_or(ConnectivityStatus::Unknown),
        }
    }
}

/// Tags marking a connection as always alive with the given priority.
pub fn journal_tags(priority: Option<i32>) -> BTreeSet<String> {
    BTreeSet::from([
        ALWAYS_ALIVE_TAG.to_string(),
        format!("{PRIORITY_TAG_PREFIX}{}", priority.unwrap_or(0)),
    ])
}

/// Tags to persist with `event`: only events leaving the connection open are tagged.
pub fn tags_for_event(
    event: &ConnectivityEvent,
    entity: Option<&Connection>,
    priority: Option<i32>,
) -> BTreeSet<String> {
    if event.target_status(entity) == ConnectivityStatus::Open {
        journal_tags(priority)
    } else {
        BTreeSet::new()
    }
}

/// Priority carried by a set of journal tags.
pub fn priority_from_tags(tags: &BTreeSet<String>) -> Option<i32> {
    tags.iter()
        .find_map(|tag| tag.strip_prefix(PRIORITY_TAG_PREFIX)?.parse().ok())
}

/// One event in a connection's journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub connection_id: String,
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub event: ConnectivityEvent,
}

impl JournalEntry {
    pub fn to_json(&self) -> ConnectivityResult<String> {
        sonic_rs::to_string(self).map_err(|err| ConnectivityError::Persistence(err.to_string()))
    }

    pub fn from_json(json: &str) -> ConnectivityResult<Self> {
        sonic_rs::from_str(json).map_err(|err| ConnectivityError::Persistence(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConnectionType;

    fn connection(status: ConnectivityStatus) -> Connection {
        Connection::new("c-1", ConnectionType::Mqtt, "tcp://broker:1883", status)
    }

    #[test]
    fn only_open_targets_are_tagged() {
        let open = connection(ConnectivityStatus::Open);
        let closed = connection(ConnectivityStatus::Closed);

        let created = ConnectivityEvent::Created {
            connection: open.clone(),
        };
        assert_eq!(
            tags_for_event(&created, None, Some(7)),
            BTreeSet::from(["always-alive".to_string(), "priority:7".to_string()])
        );
        assert!(tags_for_event(&ConnectivityEvent::Closed, Some(&open), None).is_empty());
        assert!(tags_for_event(&ConnectivityEvent::Deleted, Some(&open), None).is_empty());
        assert_eq!(
            tags_for_event(&ConnectivityEvent::Opened, Some(&closed), None),
            journal_tags(None)
        );

        let empty = ConnectivityEvent::Empty {
            effect: PRIORITY_UPDATE_EFFECT.to_string(),
        };
        assert!(tags_for_event(&empty, None, Some(1)).is_empty());
        assert_eq!(tags_for_event(&empty, Some(&open), Some(1)), journal_tags(Some(1)));
    }

    #[test]
    fn events_drive_entity() {
        let created = ConnectivityEvent::Created {
            connection: connection(ConnectivityStatus::Closed),
        };
        let entity = created.apply(None);
        let entity = ConnectivityEvent::Opened.apply(entity).expect("entity");
        assert_eq!(entity.connection_status, ConnectivityStatus::Open);
        assert!(!entity.is_deleted());

        let deleted = ConnectivityEvent::Deleted.apply(Some(entity)).expect("entity");
        assert!(deleted.is_deleted());
        assert_eq!(deleted.connection_status, ConnectivityStatus::Closed);
        assert_eq!(ConnectivityEvent::Opened.apply(None), None);
    }

    #[test]
    fn priority_is_read_back_from_tags() {
        assert_eq!(priority_from_tags(&journal_tags(Some(42))), Some(42));
        assert_eq!(priority_from_tags(&BTreeSet::new()), None);
    }

    #[test]
    fn entry_survives_json() {
        let entry = JournalEntry {
            connection_id: "c-1".to_string(),
            revision: 3,
            timestamp: Utc::now(),
            correlation_id: Some("corr".to_string()),
            tags: journal_tags(Some(2)),
            event: ConnectivityEvent::Modified {
                connection: connection(ConnectivityStatus::Open),
            },
        };
        let json = entry.to_json().expect("encode");
        assert!(json.contains("\"modified\""));
        assert_eq!(JournalEntry::from_json(&json).expect("decode"), entry);
    }
}
