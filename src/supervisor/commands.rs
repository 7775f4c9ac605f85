//! Management command surface of a connection supervisor.

use chrono::{DateTime, Utc};

use crate::core::{
    Connection, ConnectionLogs, ConnectionMetrics, ConnectivityStatus, ResourceStatus, ResourceType,
};

/// Command sent to the supervisor of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityCommand {
    Create(Connection),
    Modify(Connection),
    Delete,
    Open,
    Close,
    Test(Connection),
    Retrieve,
    RetrieveStatus,
    RetrieveMetrics,
    RetrieveLogs,
    EnableLogs,
    DisableLogs,
    ResetLogs,
    ResetMetrics,
}

impl ConnectivityCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "CreateConnection",
            Self::Modify(_) => "ModifyConnection",
            Self::Delete => "DeleteConnection",
            Self::Open => "OpenConnection",
            Self::Close => "CloseConnection",
            Self::Test(_) => "TestConnection",
            Self::Retrieve => "RetrieveConnection",
            Self::RetrieveStatus => "RetrieveConnectionStatus",
            Self::RetrieveMetrics => "RetrieveConnectionMetrics",
            Self::RetrieveLogs => "RetrieveConnectionLogs",
            Self::EnableLogs => "EnableConnectionLogs",
            Self::DisableLogs => "DisableConnectionLogs",
            Self::ResetLogs => "ResetConnectionLogs",
            Self::ResetMetrics => "ResetConnectionMetrics",
        }
    }
}

/// Live status of a connection, aggregated over its client instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatusReport {
    pub connection_id: String,
    pub desired_status: ConnectivityStatus,
    pub live_status: ConnectivityStatus,
    pub resources: Vec<ResourceStatus>,
}

impl ConnectionStatusReport {
    pub fn new(
        connection_id: impl Into<String>,
        desired_status: ConnectivityStatus,
        resources: Vec<ResourceStatus>,
    ) -> Self {
        let live_status = aggregate_live_status(
            resources
                .iter()
                .filter(|r| r.resource_type == ResourceType::Client)
                .map(|r| r.status),
        );
        Self {
            connection_id: connection_id.into(),
            desired_status,
            live_status,
            resources,
        }
    }

    /// Report for a connection without running client instances.
    pub fn closed(
        connection_id: impl Into<String>,
        desired_status: ConnectivityStatus,
        closed_since: Option<DateTime<Utc>>,
    ) -> Self {
        let connection_id = connection_id.into();
        let client = ResourceStatus {
            resource_type: ResourceType::Client,
            client: connection_id.clone(),
            address: None,
            status: ConnectivityStatus::Closed,
            status_details: Some("[DISCONNECTED] connection is closed".to_string()),
            in_state_since: Some(closed_since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)),
        };
        Self {
            connection_id,
            desired_status,
            live_status: ConnectivityStatus::Closed,
            resources: vec![client],
        }
    }

    pub fn client_records(&self) -> impl Iterator<Item = &ResourceStatus> {
        self.resources
            .iter()
            .filter(|r| r.resource_type == ResourceType::Client)
    }
}

/// All OPEN is OPEN; any FAILED is FAILED, then any MISCONFIGURED; all CLOSED is CLOSED;
/// anything else, including no instance at all, is UNKNOWN.
pub fn aggregate_live_status(statuses: impl IntoIterator<Item = ConnectivityStatus>) -> ConnectivityStatus {
    let statuses: Vec<ConnectivityStatus> = statuses.into_iter().collect();
    if statuses.is_empty() {
        return ConnectivityStatus::Unknown;
    }
    let all = |status| statuses.iter().all(|s| *s == status);
    let any = |status| statuses.contains(&status);
    if all(ConnectivityStatus::Open) {
        ConnectivityStatus::Open
    } else if any(ConnectivityStatus::Failed) {
        ConnectivityStatus::Failed
    } else if any(ConnectivityStatus::Misconfigured) {
        ConnectivityStatus::Misconfigured
    } else if all(ConnectivityStatus::Closed) {
        ConnectivityStatus::Closed
    } else {
        ConnectivityStatus::Unknown
    }
}

/// Successful answer to a [`ConnectivityCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityResponse {
    Created(Connection),
    Modified,
    Deleted,
    Opened,
    Closed,
    /// Outcome message of a connection test.
    Tested(String),
    Retrieved(Connection),
    Status(ConnectionStatusReport),
    Metrics(ConnectionMetrics),
    Logs(ConnectionLogs),
    LogsEnabled,
    LogsDisabled,
    LogsReset,
    MetricsReset,
}
