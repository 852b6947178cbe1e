use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use uuid::Uuid;

use crate::metrics;
use crate::ws::message::Envelope;

use super::{ConnectionHandle, ConnectionRegistry, SubscriptionManager};

/// Maximum number of concurrent sends within one fan-out
const MAX_CONCURRENT_SENDS: usize = 100;

/// Outcome of one fan-out call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Computes the target connection set for each outbound event and hands
/// envelopes to the per-connection transports. Transport failures stay local
/// to the failing target.
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionManager>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            registry,
            subscriptions,
        }
    }

    /// Single target. An unknown id means the connection already went away;
    /// that is a disconnect race, not an error.
    pub async fn to_connection(&self, connection_id: Uuid, envelope: Envelope) -> DeliveryReport {
        match self.registry.get(connection_id) {
            Some(connection) => self.send_all(&[connection], envelope).await,
            None => DeliveryReport::default(),
        }
    }

    /// Every connection belonging to a user.
    pub async fn to_user(&self, user_id: &str, envelope: Envelope) -> DeliveryReport {
        let targets = self.registry.connections_for_user(user_id);
        self.send_all(&targets, envelope).await
    }

    /// Every registered connection, minus the excluded user's. Used for
    /// presence broadcasts so a user never receives its own presence echo.
    pub async fn to_all_except(
        &self,
        envelope: Envelope,
        excluded_user: Option<&str>,
    ) -> DeliveryReport {
        let targets: Vec<_> = self
            .registry
            .all()
            .into_iter()
            .filter(|c| excluded_user != Some(c.user_id.as_str()))
            .collect();
        self.send_all(&targets, envelope).await
    }

    /// Everyone currently subscribed to a channel. Subscriber ids whose
    /// connection has vanished are skipped.
    pub async fn to_channel_subscribers(&self, channel: &str, envelope: Envelope) -> DeliveryReport {
        let targets: Vec<_> = self
            .subscriptions
            .subscribers_of(channel)
            .into_iter()
            .filter_map(|id| self.registry.get(id))
            .collect();
        self.send_all(&targets, envelope).await
    }

    /// Hand one envelope to every target transport. All sends complete before
    /// this returns, so sequential fan-out calls from one publisher reach each
    /// recipient in call order. A failed target counts as an implicit
    /// disconnect and never interrupts the rest of the fan-out.
    async fn send_all(
        &self,
        targets: &[Arc<ConnectionHandle>],
        envelope: Envelope,
    ) -> DeliveryReport {
        if targets.is_empty() {
            return DeliveryReport::default();
        }

        let mut report = DeliveryReport::default();

        if targets.len() <= 3 {
            // Small fan-outs go sequentially
            for connection in targets {
                match connection.send(envelope.clone()).await {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::debug!(
                            connection_id = %connection.id,
                            error = %e,
                            "Send failed, treating target as disconnected"
                        );
                    }
                }
            }
        } else {
            // Larger fan-outs with bounded concurrency
            let mut in_flight = FuturesUnordered::new();
            let mut pending = 0usize;

            for connection in targets {
                let connection = connection.clone();
                let envelope = envelope.clone();
                in_flight.push(async move {
                    let result = connection.send(envelope).await;
                    (connection.id, result)
                });
                pending += 1;

                while pending >= MAX_CONCURRENT_SENDS {
                    match in_flight.next().await {
                        Some(outcome) => {
                            pending -= 1;
                            tally(&mut report, outcome);
                        }
                        None => break,
                    }
                }
            }

            while let Some(outcome) = in_flight.next().await {
                tally(&mut report, outcome);
            }
        }

        metrics::MESSAGES_DELIVERED_TOTAL.inc_by(report.delivered as u64);
        if report.failed > 0 {
            metrics::MESSAGES_FAILED_TOTAL.inc_by(report.failed as u64);
        }

        report
    }
}

fn tally(report: &mut DeliveryReport, outcome: (Uuid, Result<(), super::TransportClosed>)) {
    match outcome {
        (_, Ok(())) => report.delivered += 1,
        (connection_id, Err(_)) => {
            report.failed += 1;
            tracing::debug!(
                connection_id = %connection_id,
                "Send failed, treating target as disconnected"
            );
        }
    }
}
