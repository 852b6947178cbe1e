use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use uuid::Uuid;

#[derive(Default)]
struct SubscriptionInner {
    by_channel: HashMap<String, HashSet<Uuid>>,
    by_connection: HashMap<Uuid, HashSet<String>>,
}

/// Tracks which logical channels each connection has opted into. Channel names
/// match exactly; there is no wildcard or hierarchy.
#[derive(Default)]
pub struct SubscriptionManager {
    inner: RwLock<SubscriptionInner>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: subscribing twice to the same channel is a no-op.
    pub fn subscribe(&self, connection_id: Uuid, channel: &str) {
        let mut inner = self.inner.write().expect("subscription lock poisoned");

        inner
            .by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id);
        inner
            .by_connection
            .entry(connection_id)
            .or_default()
            .insert(channel.to_string());

        tracing::debug!(connection_id = %connection_id, channel = %channel, "Subscribed to channel");
    }

    /// No-op when the connection never joined the channel.
    pub fn unsubscribe(&self, connection_id: Uuid, channel: &str) {
        let mut inner = self.inner.write().expect("subscription lock poisoned");

        if let Some(subscribers) = inner.by_channel.get_mut(channel) {
            subscribers.remove(&connection_id);
            if subscribers.is_empty() {
                inner.by_channel.remove(channel);
            }
        }
        if let Some(channels) = inner.by_connection.get_mut(&connection_id) {
            channels.remove(channel);
            if channels.is_empty() {
                inner.by_connection.remove(&connection_id);
            }
        }

        tracing::debug!(connection_id = %connection_id, channel = %channel, "Unsubscribed from channel");
    }

    pub fn subscribers_of(&self, channel: &str) -> Vec<Uuid> {
        self.inner
            .read()
            .expect("subscription lock poisoned")
            .by_channel
            .get(channel)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn channels_of(&self, connection_id: Uuid) -> Vec<String> {
        self.inner
            .read()
            .expect("subscription lock poisoned")
            .by_connection
            .get(&connection_id)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every subscription owned by a connection. Part of teardown, so
    /// subscriptions never outlive registration.
    pub fn drop_connection(&self, connection_id: Uuid) {
        let mut inner = self.inner.write().expect("subscription lock poisoned");

        let Some(channels) = inner.by_connection.remove(&connection_id) else {
            return;
        };
        for channel in channels {
            if let Some(subscribers) = inner.by_channel.get_mut(&channel) {
                subscribers.remove(&connection_id);
                if subscribers.is_empty() {
                    inner.by_channel.remove(&channel);
                }
            }
        }

        tracing::debug!(connection_id = %connection_id, "Dropped all subscriptions");
    }

    /// Subscription count per connection, for hub statistics.
    pub fn subscription_counts(&self) -> HashMap<Uuid, usize> {
        self.inner
            .read()
            .expect("subscription lock poisoned")
            .by_connection
            .iter()
            .map(|(id, channels)| (*id, channels.len()))
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.inner
            .read()
            .expect("subscription lock poisoned")
            .by_channel
            .len()
    }
}
