//! Client instance state machine.
//!
//! [`ClientMachine::handle`] is a deterministic transition function: it mutates the machine's own
//! state and data and returns the [`Transition`] describing the effects the owning instance must
//! execute. It performs no I/O and never waits. Events a transition raises for itself (a
//! disconnect right after a close, a failure derived from an initialization result) are processed
//! inline before `handle` returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::state::{
    AnnouncementKind, BaseClientData, CONNECTED, ClientEvent, DISCONNECTED, Effect, OriginId,
    SshTunnelState, StateTimer, Transition,
};
use crate::config::ClientConfig;
use crate::core::{
    ClientState, Connection, ConnectionFailure, ConnectivityError, ConnectivityResult,
    ConnectivityStatus, ConnectivityStatusResolver, ReconnectTimeoutStrategy, StatusReply,
    parse_endpoint,
};

const PUBSUB_FAILURE_DESCRIPTION: &str = "The connection experienced a transient failure in the \
     distributed publish/subscribe infrastructure. Failing the connection to try again later.";

/// Static inputs of a machine, derived from the connection snapshot and client config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSettings {
    pub connection_id: String,
    pub endpoint: (String, u16),
    pub ssh_endpoint: Option<(String, u16)>,
    pub announcements: bool,
    pub connecting_min_timeout: Duration,
    pub disconnecting_max_timeout: Duration,
    pub disconnect_announcement_timeout: Duration,
    /// DISCONNECTING state timeout, including the announcement delay when announcements are sent.
    pub disconnecting_timeout: Duration,
    pub testing_timeout: Duration,
}

impl MachineSettings {
    pub fn new(connection: &Connection, config: &ClientConfig) -> ConnectivityResult<Self> {
        let ssh_endpoint = match &connection.ssh_tunnel {
            Some(tunnel) if tunnel.enabled => Some(parse_endpoint(&tunnel.uri)?),
            _ => None,
        };
        let announcements = connection.any_target_sends_announcements();
        Ok(Self {
            connection_id: connection.id.clone(),
            endpoint: connection.socket_address()?,
            ssh_endpoint,
            announcements,
            connecting_min_timeout: config.connecting_min_timeout,
            disconnecting_max_timeout: config.disconnecting_max_timeout,
            disconnect_announcement_timeout: config.disconnect_announcement_timeout,
            disconnecting_timeout: config.disconnecting_timeout(announcements),
            testing_timeout: config.testing_timeout,
        })
    }
}

/// Combine the connection test and the mapping test: success only when both succeed, otherwise
/// the connection failure takes precedence over the mapping failure.
pub fn combine_test_results(connection: StatusReply, mapping: StatusReply) -> StatusReply {
    match (connection, mapping) {
        (Ok(_), Ok(_)) => Ok("successfully connected + initialized mapper".to_string()),
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
    }
}

struct Step {
    out: Transition,
    inline: VecDeque<ClientEvent>,
}

impl Step {
    fn effect(&mut self, effect: Effect) {
        self.out.effects.push(effect);
    }

    fn reply_all(&mut self, origins: Vec<OriginId>, reply: &StatusReply) {
        for origin in origins {
            self.effect(Effect::Reply {
                origin,
                reply: reply.clone(),
            });
        }
    }
}

pub struct ClientMachine {
    settings: MachineSettings,
    state: ClientState,
    data: BaseClientData,
    strategy: Box<dyn ReconnectTimeoutStrategy>,
    resolver: Arc<dyn ConnectivityStatusResolver>,
    generation: u64,
    stash: VecDeque<ClientEvent>,
}

impl ClientMachine {
    pub fn new(
        settings: MachineSettings,
        desired_status: ConnectivityStatus,
        strategy: Box<dyn ReconnectTimeoutStrategy>,
        resolver: Arc<dyn ConnectivityStatusResolver>,
        now: DateTime<Utc>,
    ) -> Self {
        let tunnel = if settings.ssh_endpoint.is_some() {
            SshTunnelState::Enabled
        } else {
            SshTunnelState::Disabled
        };
        let data = BaseClientData::new(settings.connection_id.clone(), desired_status, tunnel, now);
        Self {
            settings,
            state: ClientState::Unknown,
            data,
            strategy,
            resolver,
            generation: 0,
            stash: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn data(&self) -> &BaseClientData {
        &self.data
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    /// Incremented on every state entry; timeouts carrying an older value are ignored.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&mut self, event: ClientEvent, now: DateTime<Utc>) -> Transition {
        let mut step = Step {
            out: Transition::default(),
            inline: VecDeque::from([event]),
        };
        while let Some(event) = step.inline.pop_front() {
            self.dispatch(event, now, &mut step);
        }
        step.out
    }

    fn dispatch(&mut self, event: ClientEvent, now: DateTime<Utc>, step: &mut Step) {
        use ClientEvent as E;
        use ClientState as S;

        if let E::StateTimeout { generation } = &event
            && *generation != self.generation
        {
            debug!(
                connection = %self.data.connection_id,
                state = %self.state,
                generation,
                current = self.generation,
                "ignoring stale state timeout"
            );
            return;
        }

        match (self.state, event) {
            (S::Unknown, E::Initialize) => self.complete_initialization(step),
            (S::Unknown, event) => self.stash.push_back(event),

            (S::Initialized | S::Disconnected, E::Open { origin }) => {
                self.open_connection(origin, step)
            }
            (S::Initialized | S::Connecting | S::Connected, E::Close { origin, shutdown }) => {
                self.close_connection(origin, shutdown, now, step)
            }
            (S::Initialized | S::Disconnected | S::Testing, E::Test { origin }) => {
                self.test_connection(origin, now, step)
            }
            (S::Disconnected, E::Close { origin, shutdown }) => {
                if let Some(origin) = origin {
                    step.effect(Effect::Reply {
                        origin,
                        reply: Ok(DISCONNECTED.to_string()),
                    });
                }
                if shutdown {
                    step.effect(Effect::Stop);
                }
            }

            (S::Connecting | S::Disconnecting, E::StateTimeout { .. }) => {
                self.connection_timed_out(now, step)
            }
            (S::Connecting, E::ProbeFailed { error }) => self.probe_failed(error, now, step),
            (S::Connecting, E::ClientConnected) => {
                info!(connection = %self.data.connection_id, "client connected, starting publisher and consumers");
                step.effect(Effect::InitializeResources);
            }
            (S::Connecting, E::InitializationResult(result)) => {
                self.handle_initialization_result(result, now, step)
            }
            (S::Connecting, E::Open { origin }) => self.data.add_session_sender(origin),
            (S::Connecting | S::Disconnecting, E::ConnectionFailure(failure)) => {
                info!(connection = %self.data.connection_id, state = %self.state, failure = %failure.description, "connection failed");
                step.effect(Effect::CleanupResources);
                let origins = self.data.take_session();
                step.reply_all(origins, &Err(failure.error.clone()));
                self.backoff_after_failure(failure, now, step);
            }
            (S::Connecting | S::Testing, E::TunnelStarted { local_port }) => {
                self.tunnel_started(local_port, step)
            }
            (S::Connecting | S::Connected | S::Testing, E::TunnelClosed { reason }) => {
                self.tunnel_closed(reason, step)
            }

            (S::Connected, E::Open { origin }) => {
                if let Some(origin) = origin {
                    step.effect(Effect::Reply {
                        origin,
                        reply: Ok(CONNECTED.to_string()),
                    });
                }
            }
            (S::Connected, E::ConnectionFailure(failure)) => {
                step.effect(Effect::CleanupResources);
                self.backoff_after_failure(failure, now, step);
            }

            (S::Disconnecting, E::SendDisconnectAnnouncement) => {
                step.effect(Effect::Announce(AnnouncementKind::Closed))
            }
            (S::Disconnecting, E::Disconnect { shutdown }) => {
                step.effect(Effect::Disconnect { shutdown });
                self.data
                    .set_details(format!("disconnecting connection at {now}"));
            }
            (S::Disconnecting, E::ClientDisconnected { shutdown }) => {
                self.client_disconnected(shutdown, now, step)
            }

            (S::Testing, E::TestResult(reply)) => {
                info!(connection = %self.data.connection_id, result = ?reply, "connection test finished");
                let origins = self.data.take_session();
                step.reply_all(origins, &reply);
                step.effect(Effect::Stop);
            }
            (S::Testing, E::StateTimeout { .. }) => {
                info!(connection = %self.data.connection_id, "connection test timed out");
                let error = ConnectivityError::connection_failed(
                    &self.data.connection_id,
                    format!(
                        "Failed to open requested connection within <{}> seconds!",
                        self.settings.testing_timeout.as_secs()
                    ),
                );
                let origins = self.data.take_session();
                step.reply_all(origins, &Err(error));
                step.effect(Effect::Stop);
            }
            (S::Testing, E::ConnectionFailure(failure)) => {
                info!(connection = %self.data.connection_id, failure = %failure.description, "connection test failed");
                step.effect(Effect::CleanupResources);
                let origins = self.data.take_session();
                step.reply_all(origins, &Err(failure.error));
                step.effect(Effect::Stop);
            }

            (state, E::BusTerminated { reason }) => {
                if state == S::Connected {
                    step.inline
                        .push_back(E::ConnectionFailure(ConnectionFailure::new(
                            ConnectivityError::PubSub(reason),
                            PUBSUB_FAILURE_DESCRIPTION,
                        )));
                } else {
                    // Every surviving bus member reports the termination; reacting once is enough.
                    error!(
                        connection = %self.data.connection_id,
                        state = %state,
                        reason = %reason,
                        "pub/sub terminated while not connected; not failing the connection"
                    );
                }
            }

            (state, event) => self.unknown_event(state, event, step),
        }
    }

    fn goto(&mut self, next: ClientState, timeout: Option<(Duration, bool)>, step: &mut Step) {
        let from = self.state;
        self.state = next;
        self.generation += 1;
        step.out.timer = match timeout {
            Some((after, jitter)) => StateTimer::Start {
                after,
                generation: self.generation,
                jitter,
            },
            None => StateTimer::Cancel,
        };
        if from != next {
            step.out.changes.push((from, next));
            if next == ClientState::Connected {
                self.strategy.reset();
                if self.settings.announcements {
                    step.effect(Effect::Announce(AnnouncementKind::Opened));
                }
            }
        }
    }

    fn complete_initialization(&mut self, step: &mut Step) {
        self.goto(ClientState::Initialized, None, step);
        while let Some(event) = self.stash.pop_back() {
            step.inline.push_front(event);
        }
    }

    fn probe_endpoints(&self) -> Vec<(String, u16)> {
        match (&self.settings.ssh_endpoint, self.data.ssh_tunnel.local_port()) {
            (Some(ssh), Some(local_port)) => {
                vec![ssh.clone(), ("localhost".to_string(), local_port)]
            }
            _ => vec![self.settings.endpoint.clone()],
        }
    }

    fn tunnel_pending(&self) -> bool {
        self.data.ssh_tunnel.is_enabled() && !self.data.ssh_tunnel.is_established()
    }

    fn open_connection(&mut self, origin: Option<OriginId>, step: &mut Step) {
        self.strategy.reset();
        self.data.desired_status = ConnectivityStatus::Open;
        if self.tunnel_pending() {
            info!(connection = %self.data.connection_id, "connection requires ssh tunnel, starting tunnel");
            step.effect(Effect::StartTunnel);
            self.data.set_session(origin);
            self.goto(
                ClientState::Connecting,
                Some((self.settings.connecting_min_timeout, false)),
                step,
            );
        } else {
            self.data.set_session(origin);
            self.do_open_connection(step);
        }
    }

    fn do_open_connection(&mut self, step: &mut Step) {
        step.effect(Effect::ProbeAndConnect {
            endpoints: self.probe_endpoints(),
        });
        self.data.failure_count = 0;
        self.goto(
            ClientState::Connecting,
            Some((self.settings.connecting_min_timeout, false)),
            step,
        );
    }

    fn close_connection(
        &mut self,
        origin: Option<OriginId>,
        shutdown: bool,
        now: DateTime<Utc>,
        step: &mut Step,
    ) {
        if self.settings.announcements {
            step.inline.push_back(ClientEvent::SendDisconnectAnnouncement);
            step.effect(Effect::Schedule {
                event: ClientEvent::Disconnect { shutdown },
                after: self.settings.disconnect_announcement_timeout,
            });
        } else {
            step.inline.push_back(ClientEvent::Disconnect { shutdown });
        }
        let timeout = self.settings.disconnecting_timeout;

        step.effect(Effect::Unsubscribe);
        self.data.set_session(origin);
        self.data.desired_status = ConnectivityStatus::Closed;
        self.data.set_details(format!(
            "cleaning up before closing or deleting connection at {now}"
        ));
        self.goto(ClientState::Disconnecting, Some((timeout, false)), step);
    }

    fn client_disconnected(&mut self, shutdown: bool, now: DateTime<Utc>, step: &mut Step) {
        step.effect(Effect::CleanupResources);
        if self.data.ssh_tunnel.is_enabled() {
            step.effect(Effect::StopTunnel);
            self.data.ssh_tunnel = SshTunnelState::Enabled;
        }
        let origins = self.data.take_session();
        step.reply_all(origins, &Ok(DISCONNECTED.to_string()));
        self.data.set_status(ConnectivityStatus::Closed, now);
        self.data.set_details(format!("Disconnected at {now}"));
        self.goto(ClientState::Disconnected, None, step);
        if shutdown {
            step.effect(Effect::Stop);
        }
    }

    fn test_connection(&mut self, origin: Option<OriginId>, now: DateTime<Utc>, step: &mut Step) {
        if self.tunnel_pending() {
            info!(connection = %self.data.connection_id, "connection test requires ssh tunnel, starting tunnel");
            step.effect(Effect::StartTunnel);
        } else {
            step.effect(Effect::ProbeAndTest {
                endpoints: self.probe_endpoints(),
            });
        }
        self.data.set_session(origin);
        self.data
            .set_details(format!("Testing connection since {now}"));
        self.goto(
            ClientState::Testing,
            Some((self.settings.testing_timeout, false)),
            step,
        );
    }

    fn connection_timed_out(&mut self, now: DateTime<Utc>, step: &mut Step) {
        let timeout_message = format!("Connection timed out at {now} while {}.", self.state);
        let origins = self.data.take_session();
        step.reply_all(
            origins,
            &Err(ConnectivityError::connection_failed(
                &self.data.connection_id,
                timeout_message.clone(),
            )),
        );
        step.effect(Effect::CleanupResources);
        self.data.failure_count = 0;

        if self.data.desired_status != ConnectivityStatus::Open {
            warn!(
                connection = %self.data.connection_id,
                desired = %self.data.desired_status,
                "connection timed out although it is not desired to be open"
            );
            self.data.set_status(ConnectivityStatus::Failed, now);
            self.data.set_details(format!(
                "{timeout_message} Desired state was: {}",
                self.data.desired_status
            ));
            self.goto(ClientState::Initialized, None, step);
            return;
        }

        if self.strategy.can_reconnect() {
            if self.tunnel_pending() {
                step.effect(Effect::StartTunnel);
            } else {
                step.effect(Effect::ProbeAndConnect {
                    endpoints: self.probe_endpoints(),
                });
            }
            let next_timeout = self.strategy.next_timeout();
            // status is preserved, e.g. MISCONFIGURED stays visible while retrying
            self.data
                .set_details(format!("{timeout_message} Will try to reconnect."));
            self.log_reconnect_plan("state_timeout", "reconnect", Some(next_timeout));
            self.goto(ClientState::Connecting, Some((next_timeout, false)), step);
        } else {
            let details = if self.data.status_details.is_empty() {
                timeout_message
            } else {
                self.data.status_details.clone()
            };
            self.data.set_details(format!(
                "{details} Reached maximum retries and thus will not try to reconnect any longer."
            ));
            self.log_reconnect_plan("state_timeout", "retries_exhausted", None);
            self.goto(ClientState::Initialized, None, step);
        }
    }

    fn probe_failed(&mut self, error: ConnectivityError, now: DateTime<Utc>, step: &mut Step) {
        let (host, port) = &self.settings.endpoint;
        let description = format!(
            "Could not establish a connection on '{host}:{port}'. Make sure the endpoint is \
             reachable and that no firewall prevents the connection."
        );
        warn!(connection = %self.data.connection_id, error = %error, "socket probe failed");
        step.effect(Effect::CleanupResources);
        let origins = self.data.take_session();
        step.reply_all(
            origins,
            &Err(ConnectivityError::connection_failed(
                &self.data.connection_id,
                description.clone(),
            )),
        );
        self.data.failure_count = 0;
        self.data.set_status(ConnectivityStatus::Misconfigured, now);
        self.data.set_details(description);
    }

    fn handle_initialization_result(
        &mut self,
        result: Result<(), ConnectivityError>,
        now: DateTime<Utc>,
        step: &mut Step,
    ) {
        match result {
            Ok(()) => {
                debug!(connection = %self.data.connection_id, "publisher, consumers and subscriptions started");
                let origins = self.data.take_session();
                step.reply_all(origins, &Ok(CONNECTED.to_string()));
                self.data.failure_count = 0;
                self.data.set_status(ConnectivityStatus::Open, now);
                self.data.set_details(format!("Connected at {now}"));
                self.goto(ClientState::Connected, None, step);
            }
            Err(err) => {
                info!(
                    connection = %self.data.connection_id,
                    error = %err,
                    "initialization failed; staying in CONNECTING to recover after backoff"
                );
                let description = err.to_string();
                step.inline
                    .push_back(ClientEvent::ConnectionFailure(ConnectionFailure::new(
                        err,
                        description,
                    )));
            }
        }
    }

    /// Enter CONNECTING without reconnecting; the reconnect happens when the backoff times out.
    fn backoff_after_failure(
        &mut self,
        failure: ConnectionFailure,
        now: DateTime<Utc>,
        step: &mut Step,
    ) {
        step.effect(Effect::Unsubscribe);
        let resolved = self.resolver.resolve(&failure);

        if self.data.desired_status != ConnectivityStatus::Open {
            self.data.set_session(None);
            self.data.set_status(resolved, now);
            self.data.set_details(failure.description);
            self.goto(ClientState::Initialized, None, step);
            return;
        }

        if !self.strategy.can_reconnect() {
            self.data.set_session(None);
            self.data.set_status(resolved, now);
            self.data.set_details(format!(
                "{} Reached maximum retries after backing off after failure and thus will not try \
                 to reconnect any longer.",
                failure.description
            ));
            self.log_reconnect_plan("connection_failure", "retries_exhausted", None);
            self.goto(ClientState::Initialized, None, step);
            return;
        }

        if self.data.failure_count > 0 {
            self.data.failure_count += 1;
            self.log_reconnect_plan("connection_failure", "already_backing_off", None);
            return;
        }

        let backoff = self.strategy.next_backoff();
        self.data.set_session(None);
        self.data.failure_count += 1;
        self.data.set_status(resolved, now);
        self.data.set_details(failure.description);
        self.log_reconnect_plan("connection_failure", "backoff", Some(backoff));
        self.goto(ClientState::Connecting, Some((backoff, true)), step);
    }

    fn tunnel_started(&mut self, local_port: u16, step: &mut Step) {
        info!(connection = %self.data.connection_id, local_port, "ssh tunnel established");
        self.data.ssh_tunnel = SshTunnelState::Established { local_port };
        match self.state {
            ClientState::Testing => step.effect(Effect::ProbeAndTest {
                endpoints: self.probe_endpoints(),
            }),
            _ if self.data.session_senders.is_empty() => {
                info!(connection = %self.data.connection_id, "reconnecting after ssh tunnel was established");
                step.effect(Effect::ProbeAndConnect {
                    endpoints: self.probe_endpoints(),
                });
            }
            _ => self.do_open_connection(step),
        }
    }

    fn tunnel_closed(&mut self, reason: String, step: &mut Step) {
        info!(connection = %self.data.connection_id, reason = %reason, "ssh tunnel closed");
        let failure = ConnectionFailure::user_related(
            ConnectivityError::driver("ssh_tunnel", &reason),
            format!("SSH tunnel closed: {reason}"),
        );
        self.data.ssh_tunnel = SshTunnelState::Failed { reason };
        step.inline.push_back(ClientEvent::ConnectionFailure(failure));
    }

    fn unknown_event(&mut self, state: ClientState, event: ClientEvent, step: &mut Step) {
        warn!(
            connection = %self.data.connection_id,
            state = %state,
            event = event.name(),
            status = %self.data.connectivity_status,
            details = %self.data.status_details,
            "received unsupported event for state"
        );
        if let Some(origin) = event.origin() {
            step.effect(Effect::Reply {
                origin,
                reply: Err(self.illegal_signal(state, event.name())),
            });
        }
    }

    fn illegal_signal(&self, state: ClientState, signal: &str) -> ConnectivityError {
        let timeout = match state {
            ClientState::Connecting => Some(self.settings.connecting_min_timeout),
            ClientState::Disconnecting => Some(self.settings.disconnecting_max_timeout),
            _ => None,
        };
        let operation = timeout.map(|timeout| {
            format!(
                "{} (timeout {}s)",
                state.to_string().to_lowercase(),
                timeout.as_secs()
            )
        });
        ConnectivityError::IllegalSignal {
            state,
            signal: signal.to_string(),
            operation,
        }
    }

    fn log_reconnect_plan(&self, event: &str, note: &str, delay: Option<Duration>) {
        let delay_ms = delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64);
        if note == "retries_exhausted" {
            warn!(
                connection = %self.data.connection_id,
                state = %self.state,
                event,
                note,
                failures = self.data.failure_count,
                status = %self.data.connectivity_status,
                details = %self.data.status_details,
                "client reconnect plan"
            );
        } else {
            info!(
                connection = %self.data.connection_id,
                state = %self.state,
                event,
                note,
                delay_ms,
                failures = self.data.failure_count,
                status = %self.data.connectivity_status,
                "client reconnect plan"
            );
        }
    }
}
