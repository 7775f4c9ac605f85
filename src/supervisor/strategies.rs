//! What a supervisor does with a command, depending on the lifecycle of its connection.

use super::commands::{ConnectivityCommand, ConnectivityResponse};
use super::events::ConnectivityEvent;
use super::staged::{ConnectionAction, StagedCommand};
use crate::core::{CommandHeaders, Connection, ConnectivityError, ConnectivityResult, ConnectivityStatus};

use ConnectionAction as A;

/// Lifecycle of the supervised connection entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Created,
    Deleted,
}

impl Lifecycle {
    pub fn of(entity: Option<&Connection>) -> Self {
        match entity {
            None => Self::Uninitialized,
            Some(connection) if connection.is_deleted() => Self::Deleted,
            Some(_) => Self::Created,
        }
    }
}

/// Stage `command` for a connection in `lifecycle`, or reject it.
pub fn stage(
    lifecycle: Lifecycle,
    connection_id: &str,
    entity: Option<&Connection>,
    command: ConnectivityCommand,
    headers: CommandHeaders,
) -> ConnectivityResult<StagedCommand> {
    match (lifecycle, command) {
        (Lifecycle::Uninitialized | Lifecycle::Deleted, ConnectivityCommand::Create(connection)) => {
            stage_create(connection_id, connection, headers)
        }
        (Lifecycle::Uninitialized, ConnectivityCommand::Test(connection)) => {
            validate_for(connection_id, &connection)?;
            let event = ConnectivityEvent::Created {
                connection: connection.clone(),
            };
            Ok(StagedCommand::new(
                ConnectivityCommand::Test(connection),
                headers,
                Some(event),
                None,
                [A::ApplyEvent, A::TestConnection, A::SendResponse, A::Passivate],
            ))
        }
        (Lifecycle::Uninitialized | Lifecycle::Deleted, _) => Err(
            ConnectivityError::ConnectionNotAccessible(connection_id.to_string()),
        ),
        (Lifecycle::Created, command) => stage_created(connection_id, entity, command, headers),
    }
}

fn validate_for(connection_id: &str, connection: &Connection) -> ConnectivityResult<()> {
    if connection.id != connection_id {
        return Err(ConnectivityError::ConfigurationInvalid(format!(
            "connection id '{}' does not match supervised connection '{connection_id}'",
            connection.id
        )));
    }
    connection.validate()
}

fn stage_create(
    connection_id: &str,
    connection: Connection,
    headers: CommandHeaders,
) -> ConnectivityResult<StagedCommand> {
    validate_for(connection_id, &connection)?;
    let mut actions = vec![A::PersistAndApplyEvent, A::BecomeCreated];
    if connection.connection_status == ConnectivityStatus::Open {
        actions.push(A::OpenConnection);
    }
    actions.extend([A::UpdateSubscriptions, A::SendResponse]);
    let event = ConnectivityEvent::Created {
        connection: connection.clone(),
    };
    Ok(StagedCommand::new(
        ConnectivityCommand::Create(connection.clone()),
        headers,
        Some(event),
        Some(ConnectivityResponse::Created(connection)),
        actions,
    ))
}

fn stage_created(
    connection_id: &str,
    entity: Option<&Connection>,
    command: ConnectivityCommand,
    headers: CommandHeaders,
) -> ConnectivityResult<StagedCommand> {
    let staged = |command: ConnectivityCommand,
                  event: Option<ConnectivityEvent>,
                  response: Option<ConnectivityResponse>,
                  actions: &[ConnectionAction]|
     -> ConnectivityResult<StagedCommand> {
        Ok(StagedCommand::new(
            command,
            headers.clone(),
            event,
            response,
            actions.iter().copied(),
        ))
    };

    match command {
        ConnectivityCommand::Create(_) => Err(ConnectivityError::ConnectionConflict(
            connection_id.to_string(),
        )),
        ConnectivityCommand::Modify(connection) => {
            validate_for(connection_id, &connection)?;
            let mut actions = vec![A::PersistAndApplyEvent, A::CloseConnection, A::StopClientActors];
            if connection.connection_status == ConnectivityStatus::Open {
                actions.push(A::OpenConnection);
            }
            actions.extend([A::UpdateSubscriptions, A::SendResponse]);
            let event = ConnectivityEvent::Modified {
                connection: connection.clone(),
            };
            staged(
                ConnectivityCommand::Modify(connection),
                Some(event),
                Some(ConnectivityResponse::Modified),
                &actions,
            )
        }
        ConnectivityCommand::Delete => staged(
            ConnectivityCommand::Delete,
            Some(ConnectivityEvent::Deleted),
            Some(ConnectivityResponse::Deleted),
            &[
                A::PersistAndApplyEvent,
                A::CloseConnection,
                A::StopClientActors,
                A::BecomeDeleted,
                A::SendResponse,
                A::Passivate,
            ],
        ),
        ConnectivityCommand::Open => staged(
            ConnectivityCommand::Open,
            Some(ConnectivityEvent::Opened),
            Some(ConnectivityResponse::Opened),
            &[
                A::PersistAndApplyEvent,
                A::OpenConnection,
                A::UpdateSubscriptions,
                A::SendResponse,
            ],
        ),
        ConnectivityCommand::Close => staged(
            ConnectivityCommand::Close,
            Some(ConnectivityEvent::Closed),
            Some(ConnectivityResponse::Closed),
            &[
                A::PersistAndApplyEvent,
                A::UpdateSubscriptions,
                A::CloseConnection,
                A::StopClientActors,
                A::SendResponse,
            ],
        ),
        ConnectivityCommand::Test(connection) => {
            validate_for(connection_id, &connection)?;
            staged(
                ConnectivityCommand::Test(connection),
                None,
                None,
                &[A::TestConnection, A::SendResponse],
            )
        }
        ConnectivityCommand::Retrieve => {
            let entity = entity
                .cloned()
                .ok_or_else(|| ConnectivityError::ConnectionNotAccessible(connection_id.to_string()))?;
            staged(
                ConnectivityCommand::Retrieve,
                None,
                Some(ConnectivityResponse::Retrieved(entity)),
                &[A::SendResponse],
            )
        }
        ConnectivityCommand::RetrieveStatus => staged(
            ConnectivityCommand::RetrieveStatus,
            None,
            None,
            &[A::RetrieveConnectionStatus],
        ),
        ConnectivityCommand::RetrieveMetrics => staged(
            ConnectivityCommand::RetrieveMetrics,
            None,
            None,
            &[A::RetrieveConnectionMetrics],
        ),
        ConnectivityCommand::RetrieveLogs => staged(
            ConnectivityCommand::RetrieveLogs,
            None,
            None,
            &[A::RetrieveConnectionLogs],
        ),
        ConnectivityCommand::EnableLogs => staged(
            ConnectivityCommand::EnableLogs,
            None,
            Some(ConnectivityResponse::LogsEnabled),
            &[
                A::BroadcastToClientActorsIfStarted,
                A::EnableLogging,
                A::SendResponse,
            ],
        ),
        ConnectivityCommand::DisableLogs => staged(
            ConnectivityCommand::DisableLogs,
            None,
            Some(ConnectivityResponse::LogsDisabled),
            &[
                A::BroadcastToClientActorsIfStarted,
                A::DisableLogging,
                A::SendResponse,
            ],
        ),
        ConnectivityCommand::ResetLogs => staged(
            ConnectivityCommand::ResetLogs,
            None,
            Some(ConnectivityResponse::LogsReset),
            &[A::BroadcastToClientActorsIfStarted, A::SendResponse],
        ),
        ConnectivityCommand::ResetMetrics => staged(
            ConnectivityCommand::ResetMetrics,
            None,
            Some(ConnectivityResponse::MetricsReset),
            &[A::BroadcastToClientActorsIfStarted, A::SendResponse],
        ),
    }
}

/// Actions replayed after recovery of a connection that should be open.
pub fn recovery(entity: &Connection) -> Option<StagedCommand> {
    (entity.connection_status == ConnectivityStatus::Open && !entity.is_deleted()).then(|| {
        StagedCommand::new(
            ConnectivityCommand::Open,
            CommandHeaders::default(),
            None,
            None,
            [A::OpenConnectionIgnoreErrors, A::UpdateSubscriptions],
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConnectionType;

    fn connection(status: ConnectivityStatus) -> Connection {
        Connection::new("c-1", ConnectionType::Amqp10, "amqps://broker:5671", status)
    }

    fn actions(staged: &StagedCommand) -> Vec<ConnectionAction> {
        staged.actions().copied().collect()
    }

    fn stage_ok(
        lifecycle: Lifecycle,
        entity: Option<&Connection>,
        command: ConnectivityCommand,
    ) -> StagedCommand {
        stage(lifecycle, "c-1", entity, command, CommandHeaders::default()).expect("staged")
    }

    #[test]
    fn create_opens_only_when_desired() {
        let open = stage_ok(
            Lifecycle::Uninitialized,
            None,
            ConnectivityCommand::Create(connection(ConnectivityStatus::Open)),
        );
        assert_eq!(
            actions(&open),
            vec![
                A::PersistAndApplyEvent,
                A::BecomeCreated,
                A::OpenConnection,
                A::UpdateSubscriptions,
                A::SendResponse
            ]
        );

        let closed = stage_ok(
            Lifecycle::Deleted,
            None,
            ConnectivityCommand::Create(connection(ConnectivityStatus::Closed)),
        );
        assert!(!actions(&closed).contains(&A::OpenConnection));
    }

    #[test]
    fn uninitialized_test_passivates() {
        let staged = stage_ok(
            Lifecycle::Uninitialized,
            None,
            ConnectivityCommand::Test(connection(ConnectivityStatus::Open)),
        );
        assert_eq!(
            actions(&staged),
            vec![A::ApplyEvent, A::TestConnection, A::SendResponse, A::Passivate]
        );
    }

    #[test]
    fn rejections_by_lifecycle() {
        let entity = connection(ConnectivityStatus::Open);
        for (lifecycle, command) in [
            (Lifecycle::Uninitialized, ConnectivityCommand::Open),
            (Lifecycle::Uninitialized, ConnectivityCommand::RetrieveStatus),
            (Lifecycle::Deleted, ConnectivityCommand::Close),
            (Lifecycle::Deleted, ConnectivityCommand::Test(entity.clone())),
        ] {
            let err = stage(lifecycle, "c-1", None, command, CommandHeaders::default()).unwrap_err();
            assert_eq!(err, ConnectivityError::ConnectionNotAccessible("c-1".to_string()));
        }

        let err = stage(
            Lifecycle::Created,
            "c-1",
            Some(&entity),
            ConnectivityCommand::Create(entity.clone()),
            CommandHeaders::default(),
        )
        .unwrap_err();
        assert_eq!(err, ConnectivityError::ConnectionConflict("c-1".to_string()));
    }

    #[test]
    fn invalid_configuration_is_rejected_before_staging() {
        let mut invalid = connection(ConnectivityStatus::Open);
        invalid.client_count = 0;
        let err = stage(
            Lifecycle::Uninitialized,
            "c-1",
            None,
            ConnectivityCommand::Create(invalid),
            CommandHeaders::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConnectivityError::ConfigurationInvalid(_)));

        let other = Connection::new("c-2", ConnectionType::Mqtt, "tcp://h:1883", ConnectivityStatus::Open);
        assert!(stage(
            Lifecycle::Uninitialized,
            "c-1",
            None,
            ConnectivityCommand::Create(other),
            CommandHeaders::default(),
        )
        .is_err());
    }

    #[test]
    fn created_table() {
        let entity = connection(ConnectivityStatus::Open);
        let created = |command| stage_ok(Lifecycle::Created, Some(&entity), command);

        assert_eq!(
            actions(&created(ConnectivityCommand::Modify(connection(ConnectivityStatus::Closed)))),
            vec![
                A::PersistAndApplyEvent,
                A::CloseConnection,
                A::StopClientActors,
                A::UpdateSubscriptions,
                A::SendResponse
            ]
        );
        assert_eq!(
            actions(&created(ConnectivityCommand::Delete)),
            vec![
                A::PersistAndApplyEvent,
                A::CloseConnection,
                A::StopClientActors,
                A::BecomeDeleted,
                A::SendResponse,
                A::Passivate
            ]
        );
        assert_eq!(
            actions(&created(ConnectivityCommand::Close)),
            vec![
                A::PersistAndApplyEvent,
                A::UpdateSubscriptions,
                A::CloseConnection,
                A::StopClientActors,
                A::SendResponse
            ]
        );
        assert_eq!(
            actions(&created(ConnectivityCommand::Test(entity.clone()))),
            vec![A::TestConnection, A::SendResponse]
        );
        assert_eq!(
            actions(&created(ConnectivityCommand::RetrieveStatus)),
            vec![A::RetrieveConnectionStatus]
        );
        assert_eq!(
            actions(&created(ConnectivityCommand::EnableLogs)),
            vec![A::BroadcastToClientActorsIfStarted, A::EnableLogging, A::SendResponse]
        );
        let mut retrieve = created(ConnectivityCommand::Retrieve);
        assert_eq!(
            retrieve.response.take(),
            Some(Ok(ConnectivityResponse::Retrieved(entity.clone())))
        );
    }

    #[test]
    fn recovery_only_for_open_connections() {
        let staged = recovery(&connection(ConnectivityStatus::Open)).expect("recovery");
        assert_eq!(
            actions(&staged),
            vec![A::OpenConnectionIgnoreErrors, A::UpdateSubscriptions]
        );
        assert!(recovery(&connection(ConnectivityStatus::Closed)).is_none());
    }

    #[test]
    fn lifecycle_of_entity() {
        assert_eq!(Lifecycle::of(None), Lifecycle::Uninitialized);
        let entity = connection(ConnectivityStatus::Open);
        assert_eq!(Lifecycle::of(Some(&entity)), Lifecycle::Created);
        let deleted = ConnectivityEvent::Deleted.apply(Some(entity)).expect("entity");
        assert_eq!(Lifecycle::of(Some(&deleted)), Lifecycle::Deleted);
    }
}
