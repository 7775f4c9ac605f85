//! Data owned by one client instance and the vocabulary of its state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::{ClientState, ConnectionFailure, ConnectivityError, ConnectivityStatus, StatusReply};

pub const CONNECTED: &str = "CONNECTED";
pub const DISCONNECTED: &str = "DISCONNECTED";

/// Handle of a caller waiting for the outcome of an open, close or test.
///
/// The instance maps origins to reply channels; the state machine only sees the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OriginId(pub u64);

/// SSH tunnel sub-state of a client instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshTunnelState {
    Disabled,
    Enabled,
    Established { local_port: u16 },
    Failed { reason: String },
}

impl SshTunnelState {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established { .. })
    }

    pub fn local_port(&self) -> Option<u16> {
        match self {
            Self::Established { local_port } => Some(*local_port),
            _ => None,
        }
    }
}

/// Per-instance, in-memory state; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseClientData {
    pub connection_id: String,
    pub connectivity_status: ConnectivityStatus,
    pub status_details: String,
    pub desired_status: ConnectivityStatus,
    pub failure_count: u32,
    pub session_senders: Vec<OriginId>,
    pub ssh_tunnel: SshTunnelState,
    pub in_status_since: DateTime<Utc>,
}

impl BaseClientData {
    pub fn new(
        connection_id: impl Into<String>,
        desired_status: ConnectivityStatus,
        ssh_tunnel: SshTunnelState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            connectivity_status: ConnectivityStatus::Unknown,
            status_details: "initialized".to_string(),
            desired_status,
            failure_count: 0,
            session_senders: Vec::new(),
            ssh_tunnel,
            in_status_since: now,
        }
    }

    pub(crate) fn set_status(&mut self, status: ConnectivityStatus, now: DateTime<Utc>) {
        if self.connectivity_status != status {
            self.in_status_since = now;
        }
        self.connectivity_status = status;
    }

    pub(crate) fn set_details(&mut self, details: impl Into<String>) {
        self.status_details = details.into();
    }

    pub(crate) fn add_session_sender(&mut self, origin: Option<OriginId>) {
        if let Some(origin) = origin
            && !self.session_senders.contains(&origin)
        {
            self.session_senders.push(origin);
        }
    }

    /// Replace the session with `origin` (or an empty session).
    pub(crate) fn set_session(&mut self, origin: Option<OriginId>) {
        self.session_senders.clear();
        self.add_session_sender(origin);
    }

    pub(crate) fn take_session(&mut self) -> Vec<OriginId> {
        std::mem::take(&mut self.session_senders)
    }
}

/// Input of the client state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Instance finished starting; leaves UNKNOWN and replays queued input.
    Initialize,
    Open {
        origin: Option<OriginId>,
    },
    Close {
        origin: Option<OriginId>,
        shutdown: bool,
    },
    Test {
        origin: Option<OriginId>,
    },
    StateTimeout {
        generation: u64,
    },
    /// Reachability probe before a connect attempt failed.
    ProbeFailed {
        error: ConnectivityError,
    },
    ClientConnected,
    /// Outcome of starting publisher, consumers and pub/sub subscriptions.
    InitializationResult(Result<(), ConnectivityError>),
    ConnectionFailure(ConnectionFailure),
    SendDisconnectAnnouncement,
    Disconnect {
        shutdown: bool,
    },
    ClientDisconnected {
        shutdown: bool,
    },
    TestResult(StatusReply),
    TunnelStarted {
        local_port: u16,
    },
    TunnelClosed {
        reason: String,
    },
    BusTerminated {
        reason: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::Open { .. } => "OpenConnection",
            Self::Close { shutdown: false, .. } => "CloseConnection",
            Self::Close { shutdown: true, .. } => "CloseConnectionAndShutdown",
            Self::Test { .. } => "TestConnection",
            Self::StateTimeout { .. } => "StateTimeout",
            Self::ProbeFailed { .. } => "ProbeFailed",
            Self::ClientConnected => "ClientConnected",
            Self::InitializationResult(_) => "InitializationResult",
            Self::ConnectionFailure(_) => "ConnectionFailure",
            Self::SendDisconnectAnnouncement => "SendDisconnectAnnouncement",
            Self::Disconnect { .. } => "Disconnect",
            Self::ClientDisconnected { .. } => "ClientDisconnected",
            Self::TestResult(_) => "TestResult",
            Self::TunnelStarted { .. } => "TunnelStarted",
            Self::TunnelClosed { .. } => "TunnelClosed",
            Self::BusTerminated { .. } => "BusTerminated",
        }
    }

    /// Caller waiting for an answer to this event, if any.
    pub fn origin(&self) -> Option<OriginId> {
        match self {
            Self::Open { origin } | Self::Close { origin, .. } | Self::Test { origin } => *origin,
            _ => None,
        }
    }
}

/// Kind of announcement a transition asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncementKind {
    Opened,
    Closed,
}

/// Side effect requested by a transition, executed by the owning instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Reply {
        origin: OriginId,
        reply: StatusReply,
    },
    /// Probe every endpoint, then ask the driver to connect.
    ProbeAndConnect {
        endpoints: Vec<(String, u16)>,
    },
    /// Probe every endpoint, then run the connection and mapping tests.
    ProbeAndTest {
        endpoints: Vec<(String, u16)>,
    },
    /// Allocate resources and start publisher, consumers and subscriptions.
    InitializeResources,
    CleanupResources,
    Unsubscribe,
    Disconnect {
        shutdown: bool,
    },
    Announce(AnnouncementKind),
    StartTunnel,
    StopTunnel,
    /// Feed `event` back into the machine after `after`.
    Schedule {
        event: ClientEvent,
        after: Duration,
    },
    Stop,
}

/// What happens to the pending state timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateTimer {
    #[default]
    Keep,
    Cancel,
    Start {
        after: Duration,
        generation: u64,
        jitter: bool,
    },
}

/// Result of feeding one event (and everything it triggers inline) into the machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub effects: Vec<Effect>,
    pub timer: StateTimer,
    /// State changes in the order they happened.
    pub changes: Vec<(ClientState, ClientState)>,
}

impl Transition {
    pub fn replies(&self) -> impl Iterator<Item = (OriginId, &StatusReply)> {
        self.effects.iter().filter_map(|effect| match effect {
            Effect::Reply { origin, reply } => Some((*origin, reply)),
            _ => None,
        })
    }
}
