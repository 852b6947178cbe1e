use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// WebSocket close codes used by the hub.
pub mod close_code {
    /// Normal closure, also used for heartbeat eviction.
    pub const NORMAL: u16 = 1000;
    /// Policy violation: missing or invalid identity.
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// Author recorded on hub-originated envelopes.
pub const SYSTEM_USER: &str = "system";

/// Event kinds a client may receive after the handshake.
pub const CAPABILITIES: [&str; 4] = [
    "generation_progress",
    "gallery_update",
    "notification",
    "user_presence",
];

/// Closed set of wire message types. Anything else is rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Ping,
    Pong,
    ConnectionAck,
    GenerationProgress,
    GalleryUpdate,
    Notification,
    UserPresence,
    SystemStatus,
}

/// The wire unit exchanged between client and hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

impl Envelope {
    /// Envelope authored by the hub itself.
    pub fn system(kind: MessageKind, data: Value, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            user_id: SYSTEM_USER.to_string(),
            data,
            timestamp: now,
            id: Some(Uuid::new_v4()),
        }
    }

    /// Envelope authored on behalf of a connected user.
    pub fn from_user(
        kind: MessageKind,
        user_id: impl Into<String>,
        data: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            data,
            timestamp: now,
            id: Some(Uuid::new_v4()),
        }
    }

    /// Handshake acknowledgement carrying the assigned connection id.
    pub fn connection_ack(connection_id: Uuid, now: DateTime<Utc>) -> Self {
        Self::system(
            MessageKind::ConnectionAck,
            json!({
                "connectionId": connection_id,
                "capabilities": CAPABILITIES,
            }),
            now,
        )
    }

    /// Heartbeat reply.
    pub fn pong(now: DateTime<Utc>) -> Self {
        Self::system(MessageKind::Pong, Value::Null, now)
    }

    /// Presence broadcast for a user whose last connection went away.
    pub fn presence_offline(user_id: &str, now: DateTime<Utc>) -> Self {
        Self::from_user(
            MessageKind::UserPresence,
            user_id,
            json!({
                "status": "offline",
                "timestamp": now,
            }),
            now,
        )
    }

    /// Advisory cancellation notice re-broadcast to a channel's subscribers.
    pub fn cancelled(
        kind: MessageKind,
        user_id: &str,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::from_user(
            kind,
            user_id,
            json!({
                "channel": channel,
                "status": "cancelled",
            }),
            now,
        )
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Control surface carried in the `data.action` field of domain messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Cancel { channel: String },
}

impl ControlAction {
    /// Decode the control action, if any, from a domain envelope's payload.
    /// `None` means the payload carries no action field at all.
    pub fn from_data(data: &Value) -> Option<serde_json::Result<Self>> {
        data.get("action")?;
        Some(serde_json::from_value(data.clone()))
    }
}
