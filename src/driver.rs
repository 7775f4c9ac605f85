//! Transport boundary of a client instance.
//!
//! A driver wraps one broker client library. The client instance never blocks on it: every
//! operation returns a boxed future that the instance runs on a spawned task, and the outcome is
//! fed back into the state machine as an ordinary event. Events the broker raises on its own
//! (a dropped socket, a closed tunnel, a crashed consumer) are pushed through [`DriverEvents`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::core::{
    Connection, ConnectionFailure, ConnectionLoggerRegistry, ConnectionMetricsRegistry,
    ConnectivityError, ConnectivityResult, ResourceStatus,
};

pub type DriverFuture<T> = Pin<Box<dyn Future<Output = ConnectivityResult<T>> + Send + 'static>>;

/// Announcement published to targets subscribed to connection announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAnnouncement {
    Opened { at: DateTime<Utc> },
    Closed { at: DateTime<Utc> },
}

/// Helper a driver spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildKind {
    Publisher,
    Consumer(String),
    Tunnel,
    Other(String),
}

/// Failure of a driver helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildError {
    /// Typed protocol error that belongs on the outbound path, not to the connection.
    Protocol(String),
    Unexpected(String),
}

/// Unsolicited notifications from the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    ConnectionFailure(ConnectionFailure),
    TunnelClosed(String),
    ChildFailed { child: ChildKind, error: ChildError },
}

/// Sink through which a driver reports [`DriverEvent`]s to its client instance.
#[derive(Debug, Clone)]
pub struct DriverEvents {
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl DriverEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the client instance is gone.
    pub fn emit(&self, event: DriverEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Shared registries handed to a driver at creation.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub client_id: String,
    pub metrics: ConnectionMetricsRegistry,
    pub logs: Arc<ConnectionLoggerRegistry>,
}

/// Capabilities a concrete transport provides to the client state machine.
pub trait ClientDriver: Send + Sync + 'static {
    /// Called once when the owning instance starts.
    fn bind(&mut self, _events: DriverEvents) {}

    /// TCP reachability check before connecting.
    fn probe(&self, host: String, port: u16, timeout: Duration) -> DriverFuture<()> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host.as_str(), port)))
                .await
            {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(err)) => Err(ConnectivityError::driver("probe", err)),
                Err(_) => Err(ConnectivityError::Timeout {
                    context: format!("probing {host}:{port}"),
                }),
            }
        })
    }

    /// Establish the broker connection; resolving `Ok` means the client is connected.
    fn connect(&self) -> DriverFuture<()>;

    fn disconnect(&self) -> DriverFuture<()>;

    /// Dry-run connection test.
    fn test_connection(&self, connection: Arc<Connection>) -> DriverFuture<String>;

    /// Validate the payload mappings of `connection`.
    fn test_mapping(&self, _connection: Arc<Connection>) -> DriverFuture<String> {
        Box::pin(async { Ok("mapping processor initialized".to_string()) })
    }

    /// Allocate per-connection resources after the broker accepted the connection.
    fn allocate_resources(&mut self) {}

    fn start_publisher(&self) -> DriverFuture<()>;

    fn start_consumers(&self) -> DriverFuture<()>;

    /// Stop publisher and consumers. Must be idempotent.
    fn cleanup_resources(&mut self);

    fn send_announcement(&self, _announcement: ConnectionAnnouncement) -> DriverFuture<()> {
        Box::pin(async { Ok(()) })
    }

    /// Status of sources, targets and tunnel, excluding the client record.
    fn resource_statuses(&self) -> Vec<ResourceStatus> {
        Vec::new()
    }

    /// Start the SSH tunnel; resolves to the local forwarded port.
    fn start_tunnel(&self) -> DriverFuture<u16> {
        Box::pin(async {
            Err(ConnectivityError::InitializationFailed(
                "driver does not support ssh tunnels".to_string(),
            ))
        })
    }

    fn stop_tunnel(&mut self) {}

    /// Hand a typed protocol error from a helper to the outbound path.
    fn forward_protocol_error(&self, _error: String) {}

    fn stop_child(&mut self, _child: &ChildKind) {}

    /// Restart a helper in place, keeping its configuration.
    fn restart_child(&mut self, _child: &ChildKind) {}
}

/// Creates one driver per client instance.
pub trait DriverFactory: Send + Sync + 'static {
    type Driver: ClientDriver;

    fn create(
        &self,
        connection: &Connection,
        context: DriverContext,
    ) -> ConnectivityResult<Self::Driver>;
}
