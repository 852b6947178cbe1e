use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::hub::{
    BroadcastRouter, ConnectionHandle, ConnectionRegistry, RegistryError, SubscriptionManager,
};
use crate::ws::message::{ControlAction, Envelope, MessageKind};

/// Connection lifecycle states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

/// Per-connection state machine: handshake, active messaging, teardown.
/// State transitions are the only place this session mutates shared hub state,
/// and teardown is guarded so it can never run twice.
pub struct Session {
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<BroadcastRouter>,
    state: SessionState,
    connection: Option<Arc<ConnectionHandle>>,
}

impl Session {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        router: Arc<BroadcastRouter>,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            router,
            state: SessionState::Connecting,
            connection: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handshake identity accepted; registration is the next step.
    pub fn authenticated(&mut self) {
        debug_assert_eq!(self.state, SessionState::Connecting);
        self.transition(SessionState::Authenticated);
    }

    /// Register the connection with the hub and produce the acknowledgement
    /// envelope carrying the assigned id and capability list.
    pub fn activate(
        &mut self,
        connection: Arc<ConnectionHandle>,
    ) -> Result<Envelope, RegistryError> {
        debug_assert_eq!(self.state, SessionState::Authenticated);
        self.registry.register(connection.clone())?;
        let ack = Envelope::connection_ack(connection.id, self.registry.now());
        self.connection = Some(connection);
        self.transition(SessionState::Active);
        Ok(ack)
    }

    /// Process one decoded inbound envelope.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        if self.state != SessionState::Active {
            return;
        }
        let Some(connection) = &self.connection else {
            return;
        };

        match envelope.kind {
            MessageKind::Ping => {
                self.registry.mark_alive(connection.id);
                let _ = connection.send(Envelope::pong(self.registry.now())).await;
            }
            MessageKind::GenerationProgress | MessageKind::GalleryUpdate => {
                self.handle_control(connection, envelope).await;
            }
            MessageKind::UserPresence => {
                self.fan_out_presence(connection, envelope).await;
            }
            MessageKind::Pong
            | MessageKind::ConnectionAck
            | MessageKind::Notification
            | MessageKind::SystemStatus => {
                tracing::debug!(
                    connection_id = %connection.id,
                    kind = ?envelope.kind,
                    "Ignoring unexpected client envelope"
                );
            }
        }
    }

    /// Subscribe/unsubscribe/cancel control surface of domain messages.
    async fn handle_control(&self, connection: &Arc<ConnectionHandle>, envelope: Envelope) {
        match ControlAction::from_data(&envelope.data) {
            Some(Ok(ControlAction::Subscribe { channel })) => {
                self.subscriptions.subscribe(connection.id, &channel);
            }
            Some(Ok(ControlAction::Unsubscribe { channel })) => {
                self.subscriptions.unsubscribe(connection.id, &channel);
            }
            Some(Ok(ControlAction::Cancel { channel })) => {
                // Advisory only: tell the channel's audience, don't touch the
                // workflow that produced the events.
                let notice = Envelope::cancelled(
                    envelope.kind,
                    &connection.user_id,
                    &channel,
                    self.registry.now(),
                );
                self.router.to_channel_subscribers(&channel, notice).await;
            }
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection.id,
                    error = %e,
                    "Discarding domain message with malformed action"
                );
            }
            None => {
                tracing::debug!(
                    connection_id = %connection.id,
                    kind = ?envelope.kind,
                    "Domain message without action field ignored"
                );
            }
        }
    }

    /// Stamp a client presence update with server time and fan it out to
    /// everyone but its author.
    async fn fan_out_presence(&self, connection: &Arc<ConnectionHandle>, mut envelope: Envelope) {
        let now = self.registry.now();
        if let Some(fields) = envelope.data.as_object_mut() {
            fields.insert("timestamp".to_string(), json!(now));
        }
        envelope.timestamp = now;
        envelope.user_id = connection.user_id.clone();

        self.router
            .to_all_except(envelope, Some(&connection.user_id))
            .await;
    }

    /// Tear the connection down. Idempotent; the first caller wins.
    pub async fn close(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.transition(SessionState::Closing);
        if let Some(connection) = self.connection.take() {
            finalize_disconnect(
                &self.registry,
                &self.subscriptions,
                &self.router,
                connection.id,
            )
            .await;
        }
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!(from = ?self.state, to = ?next, "Session transition");
        self.state = next;
    }
}

/// Common teardown path for explicit close, transport error and heartbeat
/// eviction. Returns true when an offline-presence broadcast went out.
pub async fn finalize_disconnect(
    registry: &Arc<ConnectionRegistry>,
    subscriptions: &Arc<SubscriptionManager>,
    router: &Arc<BroadcastRouter>,
    connection_id: Uuid,
) -> bool {
    let Some(removed) = registry.unregister(connection_id) else {
        return false;
    };
    subscriptions.drop_connection(connection_id);

    if removed.last_for_user {
        let user_id = removed.connection.user_id.as_str();
        let offline = Envelope::presence_offline(user_id, registry.now());
        router.to_all_except(offline, Some(user_id)).await;
        tracing::debug!(user_id = %user_id, "User went offline");
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Outbound, SystemClock};
    use crate::ws::message::SYSTEM_USER;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct TestHub {
        registry: Arc<ConnectionRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        router: Arc<BroadcastRouter>,
    }

    fn test_hub() -> TestHub {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(SystemClock)));
        let subscriptions = Arc::new(SubscriptionManager::new());
        let router = Arc::new(BroadcastRouter::new(registry.clone(), subscriptions.clone()));
        TestHub {
            registry,
            subscriptions,
            router,
        }
    }

    fn active_session(hub: &TestHub, user_id: &str) -> (Session, mpsc::Receiver<Outbound>) {
        let mut session = Session::new(
            hub.registry.clone(),
            hub.subscriptions.clone(),
            hub.router.clone(),
        );
        session.authenticated();

        let (tx, rx) = mpsc::channel(16);
        let connection = Arc::new(ConnectionHandle::new(user_id, tx, hub.registry.now()));
        session.activate(connection).unwrap();
        (session, rx)
    }

    fn client_envelope(kind: MessageKind, user_id: &str, data: serde_json::Value) -> Envelope {
        Envelope {
            kind,
            user_id: user_id.to_string(),
            data,
            timestamp: Utc::now(),
            id: None,
        }
    }

    fn expect_envelope(outbound: Outbound) -> Envelope {
        match outbound {
            Outbound::Envelope(envelope) => envelope,
            other => panic!("expected envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_activation_registers_and_returns_ack() {
        let hub = test_hub();
        let mut session = Session::new(
            hub.registry.clone(),
            hub.subscriptions.clone(),
            hub.router.clone(),
        );
        session.authenticated();
        assert_eq!(session.state(), SessionState::Authenticated);

        let (tx, _rx) = mpsc::channel(16);
        let connection = Arc::new(ConnectionHandle::new("u1", tx, hub.registry.now()));
        let connection_id = connection.id;

        let ack = session.activate(connection).unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(hub.registry.stats().connection_count, 1);
        assert_eq!(ack.kind, MessageKind::ConnectionAck);
        assert_eq!(ack.data["connectionId"], json!(connection_id));
        assert_eq!(ack.data["capabilities"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_ping_marks_alive_and_replies_pong() {
        let hub = test_hub();
        let (session, mut rx) = active_session(&hub, "u1");

        session
            .handle_envelope(client_envelope(MessageKind::Ping, "u1", json!({})))
            .await;

        let reply = expect_envelope(rx.try_recv().unwrap());
        assert_eq!(reply.kind, MessageKind::Pong);
        assert_eq!(reply.user_id, SYSTEM_USER);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_actions() {
        let hub = test_hub();
        let (session, _rx) = active_session(&hub, "u1");
        let connection_id = hub.registry.all()[0].id;

        session
            .handle_envelope(client_envelope(
                MessageKind::GenerationProgress,
                "u1",
                json!({"action": "subscribe", "channel": "generation:42"}),
            ))
            .await;
        assert_eq!(
            hub.subscriptions.subscribers_of("generation:42"),
            vec![connection_id]
        );

        session
            .handle_envelope(client_envelope(
                MessageKind::GenerationProgress,
                "u1",
                json!({"action": "unsubscribe", "channel": "generation:42"}),
            ))
            .await;
        assert!(hub.subscriptions.subscribers_of("generation:42").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_notifies_channel_subscribers() {
        let hub = test_hub();
        let (session, _rx) = active_session(&hub, "u1");

        let (tx, mut watcher_rx) = mpsc::channel(16);
        let watcher = Arc::new(ConnectionHandle::new("u2", tx, hub.registry.now()));
        hub.registry.register(watcher.clone()).unwrap();
        hub.subscriptions.subscribe(watcher.id, "generation:7");

        session
            .handle_envelope(client_envelope(
                MessageKind::GenerationProgress,
                "u1",
                json!({"action": "cancel", "channel": "generation:7"}),
            ))
            .await;

        let notice = expect_envelope(watcher_rx.try_recv().unwrap());
        assert_eq!(notice.kind, MessageKind::GenerationProgress);
        assert_eq!(notice.data["status"], "cancelled");
        assert_eq!(notice.data["channel"], "generation:7");
        assert_eq!(notice.user_id, "u1");
    }

    #[tokio::test]
    async fn test_presence_update_excludes_author() {
        let hub = test_hub();
        let (session, mut own_rx) = active_session(&hub, "u1");

        let (tx, mut other_rx) = mpsc::channel(16);
        let other = Arc::new(ConnectionHandle::new("u2", tx, hub.registry.now()));
        hub.registry.register(other).unwrap();

        session
            .handle_envelope(client_envelope(
                MessageKind::UserPresence,
                "u1",
                json!({"status": "away"}),
            ))
            .await;

        let update = expect_envelope(other_rx.try_recv().unwrap());
        assert_eq!(update.kind, MessageKind::UserPresence);
        assert_eq!(update.data["status"], "away");
        assert!(update.data["timestamp"].is_string());
        assert!(own_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unexpected_client_kinds_are_discarded() {
        let hub = test_hub();
        let (session, mut rx) = active_session(&hub, "u1");

        session
            .handle_envelope(client_envelope(
                MessageKind::SystemStatus,
                "u1",
                json!({"status": "fake"}),
            ))
            .await;

        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_close_runs_teardown_exactly_once() {
        let hub = test_hub();
        let (mut session, _rx) = active_session(&hub, "u1");

        let (tx, mut observer_rx) = mpsc::channel(16);
        let observer = Arc::new(ConnectionHandle::new("u2", tx, hub.registry.now()));
        hub.registry.register(observer).unwrap();

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(hub.registry.stats().connection_count, 1);

        // Exactly one offline broadcast despite the double close
        let offline = expect_envelope(observer_rx.try_recv().unwrap());
        assert_eq!(offline.kind, MessageKind::UserPresence);
        assert_eq!(offline.data["status"], "offline");
        assert!(observer_rx.try_recv().is_err());
    }
}
