use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::HubConfig;
use crate::metrics;
use crate::ws::message::close_code;

use super::ConnectionRegistry;

/// Background task that evicts connections which stopped sending pings.
///
/// The monitor only issues close commands; the connection handler's teardown
/// path does the actual unregistration, same as for any other disconnect.
pub struct HeartbeatMonitor {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatMonitor {
    pub fn new(
        config: HubConfig,
        registry: Arc<ConnectionRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            shutdown,
        }
    }

    /// Run the liveness sweep loop until shutdown.
    pub async fn run(mut self) {
        let mut sweep_timer =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval));

        // Skip immediate first tick
        sweep_timer.tick().await;

        tracing::info!(
            sweep_interval_secs = self.config.sweep_interval,
            idle_timeout_secs = self.config.idle_timeout,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat monitor received shutdown signal");
                    break;
                }
                _ = sweep_timer.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("Heartbeat monitor stopped");
    }

    /// One liveness pass over the registry. Returns how many close commands
    /// were issued. Deterministic when the registry runs on a manual clock.
    pub async fn sweep(&self) -> usize {
        let timeout = chrono::Duration::seconds(self.config.idle_timeout as i64);
        let idle = self.registry.idle_connections(timeout);
        let evicted = idle.len();

        for connection in idle {
            tracing::info!(
                connection_id = %connection.id,
                user_id = %connection.user_id,
                idle_timeout_secs = self.config.idle_timeout,
                "Closing silent connection"
            );
            connection.close(close_code::NORMAL, "heartbeat timeout").await;
        }

        if evicted > 0 {
            metrics::HEARTBEAT_EVICTIONS_TOTAL.inc_by(evicted as u64);
        }

        evicted
    }
}
