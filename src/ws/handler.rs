use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::hub::{ConnectionHandle, Outbound};
use crate::metrics;
use crate::server::AppState;
use crate::ws::message::{close_code, Envelope};
use crate::ws::session::Session;

const CHANNEL_BUFFER_SIZE: usize = 32;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub token: Option<String>,
}

/// WebSocket upgrade handler. Identity checks happen after the upgrade so the
/// client receives a proper 1008 close frame instead of an HTTP rejection.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query),
    fields(has_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

/// Drive a single connection from handshake to teardown.
#[tracing::instrument(name = "ws.connection", skip(socket, state, query))]
async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let mut session = Session::new(
        state.registry.clone(),
        state.subscriptions.clone(),
        state.router.clone(),
    );

    // Connecting: identity must be present before anything is registered.
    let user_id = match query.user_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            tracing::warn!("Rejecting connection without userId");
            close_with(socket, close_code::POLICY_VIOLATION, "missing userId").await;
            return;
        }
    };

    // A token is optional, but a presented token must validate and match the
    // declared identity.
    if let Some(token) = query.token.as_deref() {
        match state.token_validator.validate(token) {
            Ok(claims) if claims.user_id() == user_id => {}
            Ok(claims) => {
                tracing::warn!(
                    user_id = %user_id,
                    token_sub = %claims.sub,
                    "Token subject does not match declared userId"
                );
                close_with(socket, close_code::POLICY_VIOLATION, "invalid token").await;
                return;
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Token validation failed");
                close_with(socket, close_code::POLICY_VIOLATION, "invalid token").await;
                return;
            }
        }
    }
    session.authenticated();

    let (tx, mut rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER_SIZE);
    let connection = Arc::new(ConnectionHandle::new(
        user_id.clone(),
        tx,
        state.registry.now(),
    ));
    let connection_id = connection.id;

    let ack = match session.activate(connection.clone()) {
        Ok(ack) => ack,
        Err(e) => {
            tracing::error!(connection_id = %connection_id, error = %e, "Registration failed");
            close_with(socket, close_code::NORMAL, "registration failed").await;
            return;
        }
    };

    // The ack queues onto the outbound channel and goes out once the writer
    // task starts draining it.
    if connection.send(ack).await.is_err() {
        session.close().await;
        return;
    }

    metrics::WS_CONNECTIONS_OPENED.inc();
    let connection_start = std::time::Instant::now();

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "WebSocket connection established"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer task: owns the sink, drains the outbound channel. A close command
    // (heartbeat eviction) ends the task after emitting the close frame.
    let mut writer_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Envelope(envelope) => {
                    let text = match envelope.encode() {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize envelope");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    // Reader loop: decode and dispatch until the client goes away or the
    // writer stops.
    loop {
        tokio::select! {
            result = &mut writer_task => {
                if let Err(e) = result {
                    tracing::warn!(connection_id = %connection_id, error = %e, "Writer task aborted");
                }
                break;
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(message)) => {
                        if !process_message(message, &session, &connection).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Closing: one teardown path regardless of which trigger fired.
    session.close().await;
    writer_task.abort();

    metrics::WS_CONNECTIONS_CLOSED.inc();
    let duration = connection_start.elapsed().as_secs_f64();
    metrics::WS_CONNECTION_DURATION.observe(duration);

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        duration_secs = duration,
        "WebSocket connection closed"
    );
}

/// Process one frame. Returns false when the connection should close.
async fn process_message(
    message: Message,
    session: &Session,
    connection: &Arc<ConnectionHandle>,
) -> bool {
    match message {
        Message::Text(text) => {
            match Envelope::decode(&text) {
                Ok(envelope) => session.handle_envelope(envelope).await,
                Err(e) => {
                    // Protocol errors are never fatal to the connection
                    tracing::warn!(
                        connection_id = %connection.id,
                        error = %e,
                        "Dropping malformed envelope"
                    );
                    metrics::PROTOCOL_ERRORS_TOTAL.inc();
                }
            }
            true
        }
        Message::Binary(_) => {
            tracing::warn!(connection_id = %connection.id, "Dropping unsupported binary frame");
            metrics::PROTOCOL_ERRORS_TOTAL.inc();
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            // Transport-level frames; liveness is tracked via ping envelopes
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %connection.id, "Received close frame");
            false
        }
    }
}

/// Reject a handshake with a close frame before any registration happened.
async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
