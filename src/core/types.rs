use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result alias for connectivity operations.
pub type ConnectivityResult<T> = Result<T, ConnectivityError>;

/// Canonical error surface shared by the client instances and the supervisor.
///
/// Cloneable so that one failure can be answered to every pending session sender.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("Connection '{id}' failed: {description}")]
    ConnectionFailed { id: String, description: String },

    #[error("Connection '{id}' is misconfigured: {description}")]
    Misconfigured { id: String, description: String },

    #[error("Connection configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("Connection '{0}' not found or not accessible")]
    ConnectionNotAccessible(String),

    #[error("Connection '{0}' already exists")]
    ConnectionConflict(String),

    #[error("Connection '{0}' was already created - no test possible")]
    TestRejected(String),

    #[error("Illegal signal '{signal}' in state {state}{}", operation.as_ref().map(|op| format!(" while {op}")).unwrap_or_default())]
    IllegalSignal {
        state: ClientState,
        signal: String,
        operation: Option<String>,
    },

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Driver error ({context}): {error}")]
    Driver {
        context: &'static str,
        error: String,
    },

    #[error("Pub/sub error: {0}")]
    PubSub(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl ConnectivityError {
    pub fn connection_failed(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            id: id.into(),
            description: description.into(),
        }
    }

    pub fn driver(context: &'static str, error: impl ToString) -> Self {
        Self::Driver {
            context,
            error: error.to_string(),
        }
    }

    /// Errors the operator can fix by changing the connection configuration.
    pub fn is_user_related(&self) -> bool {
        matches!(
            self,
            Self::Misconfigured { .. } | Self::ConfigurationInvalid(_)
        )
    }
}

/// Status of a connection or of one of its resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Open,
    Closed,
    Failed,
    Misconfigured,
    Unknown,
}

impl ConnectivityStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Misconfigured)
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
            Self::Misconfigured => "misconfigured",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// States of the client instance state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Unknown,
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Testing,
}

impl ClientState {
    /// Volatile states are always entered together with a state timeout.
    pub fn is_volatile(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting | Self::Testing)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Initialized => "INITIALIZED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Testing => "TESTING",
        };
        f.write_str(s)
    }
}

/// Kind of resource a [`ResourceStatus`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    Client,
    Source,
    Target,
    SshTunnel,
}

/// Per-resource status record reported to the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource_type: ResourceType,
    pub client: String,
    pub address: Option<String>,
    pub status: ConnectivityStatus,
    pub status_details: Option<String>,
    pub in_state_since: Option<DateTime<Utc>>,
}

impl ResourceStatus {
    pub fn client(
        client: impl Into<String>,
        status: ConnectivityStatus,
        details: impl Into<String>,
        in_state_since: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_type: ResourceType::Client,
            client: client.into(),
            address: None,
            status,
            status_details: Some(details.into()),
            in_state_since: Some(in_state_since),
        }
    }

    pub fn closed(
        resource_type: ResourceType,
        client: impl Into<String>,
        address: Option<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            client: client.into(),
            address,
            status: ConnectivityStatus::Closed,
            status_details: Some(details.into()),
            in_state_since: Some(Utc::now()),
        }
    }
}

/// Reply delivered to whoever asked a client instance to open, close or test.
pub type StatusReply = ConnectivityResult<String>;

/// Headers attached to management commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandHeaders {
    pub correlation_id: Option<String>,
    pub timeout: Option<Duration>,
    pub dry_run: bool,
}

impl CommandHeaders {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Pluggable observer for client state transitions.
///
/// Keeps the instance decoupled from whatever metrics or test harness watches it.
pub trait ClientObserver: Send + Sync + 'static {
    fn on_transition(&self, client_id: &str, from: ClientState, to: ClientState);

    #[inline]
    fn on_status(&self, _client_id: &str, _status: ConnectivityStatus, _details: &str) {}
}
