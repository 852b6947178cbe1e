use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::ws::message::{Envelope, MessageKind};

use super::{BroadcastRouter, ConnectionRegistry, DeliveryReport, SubscriptionManager};

/// Aggregate hub statistics exposed to external collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connection_count: usize,
    pub user_count: usize,
    pub per_connection_subscriptions: HashMap<Uuid, usize>,
}

/// Publish surface used by the dashboard's backend workflows (generation
/// progress reporters, gallery mutations, cost alerts). Pure pass-through to
/// the router; payloads are not validated here.
pub struct EventPublisher {
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<BroadcastRouter>,
}

impl EventPublisher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        router: Arc<BroadcastRouter>,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            router,
        }
    }

    /// Deliver an event to every connection a user currently holds.
    pub async fn publish_to_user(
        &self,
        user_id: &str,
        kind: MessageKind,
        data: Value,
    ) -> DeliveryReport {
        let envelope = Envelope::system(kind, data, self.registry.now());
        let report = self.router.to_user(user_id, envelope).await;
        tracing::debug!(
            user_id = %user_id,
            kind = ?kind,
            delivered = report.delivered,
            failed = report.failed,
            "Published event to user"
        );
        report
    }

    /// Deliver an event to every subscriber of a channel.
    pub async fn publish_to_channel(
        &self,
        channel: &str,
        kind: MessageKind,
        data: Value,
    ) -> DeliveryReport {
        let envelope = Envelope::system(kind, data, self.registry.now());
        let report = self.router.to_channel_subscribers(channel, envelope).await;
        tracing::debug!(
            channel = %channel,
            kind = ?kind,
            delivered = report.delivered,
            failed = report.failed,
            "Published event to channel"
        );
        report
    }

    /// Notify every connected client.
    pub async fn broadcast_notification(&self, data: Value) -> DeliveryReport {
        let envelope = Envelope::system(MessageKind::Notification, data, self.registry.now());
        let report = self.router.to_all_except(envelope, None).await;
        tracing::debug!(
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast notification"
        );
        report
    }

    /// Push a system status update to every connected client.
    pub async fn broadcast_system_status(&self, data: Value) -> DeliveryReport {
        let envelope = Envelope::system(MessageKind::SystemStatus, data, self.registry.now());
        let report = self.router.to_all_except(envelope, None).await;
        tracing::debug!(
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast system status"
        );
        report
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.registry.stats();
        HubStats {
            connection_count: registry.connection_count,
            user_count: registry.user_count,
            per_connection_subscriptions: self.subscriptions.subscription_counts(),
        }
    }
}
