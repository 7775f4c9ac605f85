//! Staged commands: a management command plus the ordered actions still to run for it.
//!
//! The supervisor interprets the actions one by one. An asynchronous action takes the staged
//! command with it and hands it back to the supervisor when it completes, so the remaining
//! actions resume where they left off.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::oneshot;
use tracing::debug;

use super::commands::{ConnectivityCommand, ConnectivityResponse};
use super::events::ConnectivityEvent;
use crate::core::{CommandHeaders, ConnectivityError, ConnectivityResult};

/// Channel on which a command's caller waits.
pub type CommandReplyTo = oneshot::Sender<ConnectivityResult<ConnectivityResponse>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    TestConnection,
    ApplyEvent,
    PersistAndApplyEvent,
    SendResponse,
    Passivate,
    OpenConnection,
    OpenConnectionIgnoreErrors,
    CloseConnection,
    StopClientActors,
    BecomeCreated,
    BecomeDeleted,
    UpdateSubscriptions,
    BroadcastToClientActorsIfStarted,
    RetrieveConnectionLogs,
    RetrieveConnectionStatus,
    RetrieveConnectionMetrics,
    EnableLogging,
    DisableLogging,
}

pub struct StagedCommand {
    pub command: ConnectivityCommand,
    pub headers: CommandHeaders,
    pub event: Option<ConnectivityEvent>,
    pub response: Option<ConnectivityResult<ConnectivityResponse>>,
    actions: VecDeque<ConnectionAction>,
    reply: Option<CommandReplyTo>,
}

impl fmt::Debug for StagedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedCommand")
            .field("command", &self.command.name())
            .field("event", &self.event.as_ref().map(ConnectivityEvent::name))
            .field("actions", &self.actions)
            .field("awaiting_reply", &self.reply.is_some())
            .finish()
    }
}

impl StagedCommand {
    pub fn new(
        command: ConnectivityCommand,
        headers: CommandHeaders,
        event: Option<ConnectivityEvent>,
        response: Option<ConnectivityResponse>,
        actions: impl IntoIterator<Item = ConnectionAction>,
    ) -> Self {
        Self {
            command,
            headers,
            event,
            response: response.map(Ok),
            actions: actions.into_iter().collect(),
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: Option<CommandReplyTo>) -> Self {
        self.reply = reply;
        self
    }

    pub fn next_action(&mut self) -> Option<ConnectionAction> {
        self.actions.pop_front()
    }

    pub fn actions(&self) -> impl Iterator<Item = &ConnectionAction> {
        self.actions.iter()
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Hand the caller's channel to work that answers it later.
    pub fn take_reply(&mut self) -> Option<CommandReplyTo> {
        self.reply.take()
    }

    /// Answer the caller directly, leaving later actions in place.
    pub fn respond(&mut self, response: ConnectivityResult<ConnectivityResponse>) {
        match self.reply.take() {
            Some(reply) => {
                let _ = reply.send(response);
            }
            None => debug!(command = self.command.name(), ?response, "no caller waiting for response"),
        }
    }

    /// Answer the caller with the staged response.
    pub fn send_response(&mut self) {
        let response = self.response.take().unwrap_or_else(|| {
            Err(ConnectivityError::Actor(format!(
                "no response staged for {}",
                self.command.name()
            )))
        });
        self.respond(response);
    }

    /// Abort: answer `error` and drop the remaining actions.
    pub fn fail(mut self, error: ConnectivityError) {
        debug!(
            command = self.command.name(),
            remaining = self.actions.len(),
            error = %error,
            "aborting staged command"
        );
        self.actions.clear();
        self.respond(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn actions_run_in_order_and_response_is_sent_once() {
        let (tx, rx) = oneshot::channel();
        let mut staged = StagedCommand::new(
            ConnectivityCommand::Open,
            CommandHeaders::default(),
            Some(ConnectivityEvent::Opened),
            Some(ConnectivityResponse::Opened),
            [
                ConnectionAction::PersistAndApplyEvent,
                ConnectionAction::SendResponse,
            ],
        )
        .with_reply(Some(tx));

        assert_eq!(staged.next_action(), Some(ConnectionAction::PersistAndApplyEvent));
        assert_eq!(staged.next_action(), Some(ConnectionAction::SendResponse));
        staged.send_response();
        assert_eq!(staged.next_action(), None);
        assert!(!staged.has_reply());
        assert_eq!(rx.await.expect("reply"), Ok(ConnectivityResponse::Opened));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fail_answers_error() {
        let (tx, rx) = oneshot::channel();
        let staged = StagedCommand::new(
            ConnectivityCommand::Close,
            CommandHeaders::default(),
            None,
            None,
            [ConnectionAction::CloseConnection, ConnectionAction::SendResponse],
        )
        .with_reply(Some(tx));
        staged.fail(ConnectivityError::Actor("boom".to_string()));
        assert_eq!(
            rx.await.expect("reply"),
            Err(ConnectivityError::Actor("boom".to_string()))
        );
    }
}
