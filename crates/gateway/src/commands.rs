//! Application of bus-originated admin commands to the live connection set.

use {
    axum::extract::ws::close_code,
    tracing::{debug, info},
};

use wsbridge_protocol::{AdminCommand, MessageType, PublishParams, UserId};

use crate::registry::Registry;

/// Apply one decoded command. Errors on individual connections are logged
/// and never escape; a command must not take the gateway down.
pub fn apply(registry: &Registry, command: AdminCommand) {
    match command {
        AdminCommand::CloseDeviceConnections(params) => {
            registry.remove_device_connections(&params.user_id, &params.device_id, |removed| {
                for connection in removed {
                    connection.close(close_code::NORMAL, &params.reason);
                }
                info!(
                    user_id = %params.user_id,
                    device_id = %params.device_id,
                    closed = removed.len(),
                    "closed device connections"
                );
            });
        },
        AdminCommand::CloseUserConnections(params) => {
            registry.remove_user_connections(&params.user_id, |removed| {
                for connection in removed {
                    connection.close(close_code::NORMAL, &params.reason);
                }
                info!(
                    user_id = %params.user_id,
                    closed = removed.len(),
                    "closed user connections"
                );
            });
        },
        AdminCommand::PublishTextMessage(params) => publish_to_recipients(registry, &params),
    }
}

fn publish_to_recipients(registry: &Registry, params: &PublishParams) {
    for recipient in &params.to {
        let connections = match (&recipient.user_id, &recipient.device_id) {
            (user_id, Some(device_id)) => registry
                .device_connections(user_id.as_ref().unwrap_or(&UserId::default()), device_id),
            (Some(user_id), None) => registry.user_connections(user_id),
            (None, None) => continue,
        };

        for connection in connections {
            let result = match params.message_type {
                MessageType::Text => connection.send_text(params.body.clone()),
                MessageType::Binary => connection.send_binary(params.body.clone()),
            };
            if let Err(e) = result {
                debug!(
                    conn_id = %connection.info().id,
                    error = %e,
                    "skipping frame for closed connection"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use wsbridge_protocol::{
        CloseDeviceParams, CloseUserParams, ConnectionId, Recipient,
    };

    use {
        super::*,
        crate::connection::{Connection, Outbound},
    };

    fn logged_in(
        id: i64,
        user: &str,
        device: &str,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(ConnectionId::new(id), sender));
        conn.login(user.into(), device.into()).unwrap();
        (conn, receiver)
    }

    #[test]
    fn close_user_connections_closes_with_reason() {
        let registry = Registry::new();
        let (target, mut target_rx) = logged_in(1, "u1", "d1");
        let (other, mut other_rx) = logged_in(2, "u2", "d1");
        registry.add(Arc::clone(&target)).unwrap();
        registry.add(Arc::clone(&other)).unwrap();

        apply(
            &registry,
            AdminCommand::CloseUserConnections(CloseUserParams {
                user_id: "u1".into(),
                reason: "bye".into(),
            }),
        );

        assert_eq!(
            target_rx.try_recv().unwrap(),
            Outbound::Close {
                code: 1000,
                reason: "bye".into(),
            }
        );
        assert!(target.info().id.is_tombstone());
        assert!(other_rx.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn close_device_connections_spares_other_devices() {
        let registry = Registry::new();
        let (target, mut target_rx) = logged_in(1, "u1", "d1");
        let (sibling, mut sibling_rx) = logged_in(2, "u1", "d2");
        registry.add(Arc::clone(&target)).unwrap();
        registry.add(Arc::clone(&sibling)).unwrap();

        apply(
            &registry,
            AdminCommand::CloseDeviceConnections(CloseDeviceParams {
                user_id: "u1".into(),
                device_id: "d1".into(),
                reason: "rotate".into(),
            }),
        );

        assert!(matches!(
            target_rx.try_recv().unwrap(),
            Outbound::Close { code: 1000, .. }
        ));
        assert!(sibling_rx.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn publish_routes_by_device_then_user() {
        let registry = Registry::new();
        let (by_device, mut by_device_rx) = logged_in(1, "u1", "d1");
        let (other_device, mut other_device_rx) = logged_in(2, "u1", "d2");
        let (by_user, mut by_user_rx) = logged_in(3, "u2", "d9");
        registry.add(by_device).unwrap();
        registry.add(other_device).unwrap();
        registry.add(by_user).unwrap();

        apply(
            &registry,
            AdminCommand::PublishTextMessage(PublishParams {
                to: vec![
                    Recipient {
                        user_id: Some("u1".into()),
                        device_id: Some("d1".into()),
                    },
                    Recipient {
                        user_id: Some("u2".into()),
                        device_id: None,
                    },
                    // No target at all: skipped.
                    Recipient::default(),
                ],
                message_type: MessageType::Text,
                body: b"hi".to_vec(),
            }),
        );

        assert_eq!(by_device_rx.try_recv().unwrap(), Outbound::Text(b"hi".to_vec()));
        assert!(other_device_rx.try_recv().is_err());
        assert_eq!(by_user_rx.try_recv().unwrap(), Outbound::Text(b"hi".to_vec()));
    }

    #[test]
    fn publish_binary_uses_binary_frames() {
        let registry = Registry::new();
        let (conn, mut rx) = logged_in(1, "u1", "d1");
        registry.add(conn).unwrap();

        apply(
            &registry,
            AdminCommand::PublishTextMessage(PublishParams {
                to: vec![Recipient {
                    user_id: Some("u1".into()),
                    device_id: None,
                }],
                message_type: MessageType::Binary,
                body: vec![1, 2, 3],
            }),
        );

        assert_eq!(rx.try_recv().unwrap(), Outbound::Binary(vec![1, 2, 3]));
    }
}
