use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::metrics;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct HubStatusResponse {
    pub status: String,
    #[serde(rename = "connectionCount")]
    pub connection_count: usize,
    #[serde(rename = "userCount")]
    pub user_count: usize,
}

/// Commands accepted from external publishers. Payload fields beyond `action`
/// pass through to clients untouched.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminCommand {
    BroadcastNotification {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    BroadcastSystemStatus {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub delivered: usize,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn hub_status(State(state): State<AppState>) -> Json<HubStatusResponse> {
    let stats = state.publisher.stats();
    Json(HubStatusResponse {
        status: "ok".to_string(),
        connection_count: stats.connection_count,
        user_count: stats.user_count,
    })
}

pub async fn admin_command(
    State(state): State<AppState>,
    Json(command): Json<AdminCommand>,
) -> Result<Json<CommandResponse>> {
    let report = match command {
        AdminCommand::BroadcastNotification { payload } => {
            state
                .publisher
                .broadcast_notification(Value::Object(payload))
                .await
        }
        AdminCommand::BroadcastSystemStatus { payload } => {
            state
                .publisher
                .broadcast_system_status(Value::Object(payload))
                .await
        }
    };

    Ok(Json(CommandResponse {
        success: report.failed == 0,
        delivered: report.delivered,
    }))
}

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    // Gauges reflect the registry at scrape time
    let stats = state.publisher.stats();
    metrics::CONNECTIONS_ACTIVE.set(stats.connection_count as i64);
    metrics::USERS_CONNECTED.set(stats.user_count as i64);
    metrics::CHANNELS_ACTIVE.set(state.subscriptions.channel_count() as i64);

    match metrics::encode() {
        Ok(output) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            output,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}
