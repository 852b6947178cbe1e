use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::handlers::{admin_command, health, hub_status, prometheus_metrics};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/status", get(hub_status))
        .route("/metrics", get(prometheus_metrics))
        // Command endpoint for external publishers
        .route("/admin/command", post(admin_command))
}
