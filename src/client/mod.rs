//! Client instances: the per-connection state machine and the actor that drives it.

pub mod actor;
pub mod fsm;
pub mod state;

pub use actor::{
    CheckLogsActive, ClientActor, ClientActorArgs, ClientEnvironment, ClientSnapshot,
    CloseConnection, DisableClientLogs, DriverNotification, EnableClientLogs,
    ForwardSearchCommand, GetClientSnapshot, LoggingActivity, MachineInput, OpenConnection,
    ReplyTo, ResetClientLogs, ResetClientMetrics, RetrieveClientLogs, RetrieveClientMetrics,
    RetrieveClientStatus, TestConnection, UpdateSiblings,
};
pub use fsm::{ClientMachine, MachineSettings, combine_test_results};
pub use state::{
    AnnouncementKind, BaseClientData, CONNECTED, ClientEvent, DISCONNECTED, Effect, OriginId,
    SshTunnelState, StateTimer, Transition,
};
