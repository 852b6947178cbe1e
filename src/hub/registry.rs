use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ws::message::Envelope;

use super::Clock;

/// Frames accepted by a connection's transport writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

#[derive(Debug, Error)]
#[error("transport closed for connection {0}")]
pub struct TransportClosed(pub Uuid);

/// One accepted transport session. The `sender` half is the connection's only
/// send/close capability; the matching receiver is owned by the socket writer.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    last_seen_ms: AtomicI64,
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(
        user_id: impl Into<String>,
        sender: mpsc::Sender<Outbound>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            connected_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            sender,
        }
    }

    /// Stamp the liveness marker. Called only for an observed ping.
    pub fn mark_alive(&self, now: DateTime<Utc>) {
        self.last_seen_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    /// How long this connection has been silent.
    pub fn idle_duration(&self, now: DateTime<Utc>) -> Duration {
        Duration::milliseconds(now.timestamp_millis() - self.last_seen_ms.load(Ordering::Relaxed))
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportClosed> {
        self.sender
            .send(Outbound::Envelope(envelope))
            .await
            .map_err(|_| TransportClosed(self.id))
    }

    /// Ask the transport writer to close the socket. A dropped receiver means
    /// the writer is already gone, which is fine.
    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self
            .sender
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .await;
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(Uuid),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub connection_count: usize,
    pub user_count: usize,
}

/// What `unregister` removed, plus whether the owning user went offline with it.
pub struct Unregistered {
    pub connection: Arc<ConnectionHandle>,
    pub last_for_user: bool,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<Uuid, Arc<ConnectionHandle>>,
    by_user: HashMap<String, HashSet<Uuid>>,
}

/// Authoritative set of live connections and the per-user index derived from
/// it. Both structures sit behind one lock so no operation can observe them
/// out of sync.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    clock: Arc<dyn Clock>,
}

impl ConnectionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            clock,
        }
    }

    /// Current time from the injected clock, for stamping envelopes and
    /// liveness markers consistently with eviction decisions.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn register(&self, connection: Arc<ConnectionHandle>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");

        if inner.connections.contains_key(&connection.id) {
            return Err(RegistryError::DuplicateConnection(connection.id));
        }

        inner
            .by_user
            .entry(connection.user_id.clone())
            .or_default()
            .insert(connection.id);
        inner.connections.insert(connection.id, connection.clone());

        tracing::info!(
            connection_id = %connection.id,
            user_id = %connection.user_id,
            "Connection registered"
        );

        Ok(())
    }

    pub fn unregister(&self, connection_id: Uuid) -> Option<Unregistered> {
        let mut inner = self.inner.write().expect("registry lock poisoned");

        let connection = inner.connections.remove(&connection_id)?;

        let mut last_for_user = false;
        if let Some(ids) = inner.by_user.get_mut(&connection.user_id) {
            ids.remove(&connection_id);
            if ids.is_empty() {
                inner.by_user.remove(&connection.user_id);
                last_for_user = true;
            }
        }

        tracing::info!(
            connection_id = %connection_id,
            user_id = %connection.user_id,
            last_for_user = last_for_user,
            "Connection unregistered"
        );

        Some(Unregistered {
            connection,
            last_for_user,
        })
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .connections
            .get(&connection_id)
            .cloned()
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Stamp the liveness marker for an observed ping.
    pub fn mark_alive(&self, connection_id: Uuid) {
        if let Some(connection) = self.get(connection_id) {
            connection.mark_alive(self.clock.now());
        }
    }

    /// Connections silent for longer than `timeout`, per the injected clock.
    pub fn idle_connections(&self, timeout: Duration) -> Vec<Arc<ConnectionHandle>> {
        let now = self.clock.now();
        self.inner
            .read()
            .expect("registry lock poisoned")
            .connections
            .values()
            .filter(|c| c.idle_duration(now) > timeout)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().expect("registry lock poisoned");
        RegistryStats {
            connection_count: inner.connections.len(),
            user_count: inner.by_user.len(),
        }
    }
}
