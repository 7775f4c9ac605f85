//! Failure policies for driver helpers and client instances.
//!
//! Client instances never restart themselves: a connection recovers by reconnecting, not by
//! recreating the instance. Helper failures are classified here and turned into ordinary
//! state-machine input; instance deaths are escalated to whoever owns the supervisor.

use kameo::error::ActorStopReason;

use crate::core::{ConnectionFailure, ConnectivityError};
use crate::driver::{ChildError, ChildKind};

/// What a client instance does with a failed helper.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildDirective {
    /// Keep the helper running and hand the protocol error to the outbound path.
    ResumeAndForward(String),
    /// Restart the helper in place.
    Restart,
    /// Stop the helper and fail the connection.
    StopAndFail(ConnectionFailure),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChildSupervisionPolicy;

impl ChildSupervisionPolicy {
    pub fn decide(&self, child: &ChildKind, error: &ChildError) -> ChildDirective {
        match (child, error) {
            (_, ChildError::Protocol(message)) => ChildDirective::ResumeAndForward(message.clone()),
            (ChildKind::Tunnel, ChildError::Unexpected(_)) => ChildDirective::Restart,
            (child, ChildError::Unexpected(message)) => {
                let description = format!("exception in child {child:?}: {message}");
                ChildDirective::StopAndFail(ConnectionFailure::new(
                    ConnectivityError::Actor(message.clone()),
                    description,
                ))
            }
        }
    }
}

/// Whether the supervisor escalates the death of a linked client instance.
///
/// Normal stops (close-and-shutdown, pool teardown) are expected; anything else is escalated.
pub fn escalates(reason: &ActorStopReason) -> bool {
    !matches!(reason, ActorStopReason::Normal | ActorStopReason::Killed)
}
