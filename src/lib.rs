//! Kameo-based broker connectivity for digital-twin connections.
//!
//! A [`ConnectionSupervisor`] owns one persisted connection and runs its client instances
//! ([`ClientActor`]), each driving a broker client through a [`ClientDriver`].

pub mod client;
pub mod config;
pub mod core;
pub mod driver;
pub mod pool;
pub mod pubsub;
pub mod supervision;
pub mod supervisor;
pub mod testing;

pub use client::{ClientActor, ClientActorArgs, ClientEnvironment, ClientSnapshot};
pub use config::{ClientConfig, ConnectivityConfig, MonitoringConfig, SupervisorConfig};
pub use driver::{ClientDriver, DriverContext, DriverEvent, DriverEvents, DriverFactory};
pub use pool::{ClientActorRefs, ClientPool, SearchCommand, SearchSessionHandler};
pub use pubsub::{InMemoryBus, MessageBus};
pub use supervisor::{
    ConnectionSupervisor, ConnectivityCommand, ConnectivityResponse, SupervisorArgs, execute,
};
