//! WebSocket endpoint and push API.

use crate::hub::ConnectionHub;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pixcast_pipeline::{
    ConnectionEvent, ConnectionRegistry, Dispatcher, PushError, PushTransport,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

/// Shared state for the gateway's handlers
#[derive(Clone)]
pub struct GatewayState {
    pub hub: Arc<ConnectionHub>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub ping_interval: Duration,
}

pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/connections/:connection_id", post(push_to_connection))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "gateway",
        "connections": state.hub.len(),
    }))
}

/// `POST /connections/{id}`: 200 when queued, 410 when the id has no socket,
/// 421 when the id was minted by another gateway instance.
#[instrument(skip(state, body), fields(bytes = body.len()))]
async fn push_to_connection(
    State(state): State<GatewayState>,
    Path(connection_id): Path<String>,
    body: Bytes,
) -> Response {
    if !state.hub.owns(&connection_id) {
        metrics::counter!("gateway.push.misdirected").increment(1);
        return (
            StatusCode::MISDIRECTED_REQUEST,
            Json(json!({ "error": "Connection belongs to another gateway instance" })),
        )
            .into_response();
    }

    match state.hub.send(&connection_id, &body).await {
        Ok(()) => {
            metrics::counter!("gateway.push.delivered").increment(1);
            StatusCode::OK.into_response()
        }
        Err(PushError::Gone) => {
            metrics::counter!("gateway.push.gone").increment(1);
            (
                StatusCode::GONE,
                Json(json!({ "error": "Connection is gone" })),
            )
                .into_response()
        }
        Err(PushError::Other(message)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let connection_id = state.hub.mint_id();

    // The outbox exists before the registry lists the id, so no push can
    // observe a registered id without a socket behind it.
    let mut outbox = state.hub.register(&connection_id);

    let connected = ConnectionEvent::Connected {
        connection_id: connection_id.clone(),
    };
    let outcome = state
        .dispatcher
        .dispatch(state.registry.as_ref(), &connected)
        .await;
    if !outcome.is_delivered() {
        warn!(connection_id = %connection_id, "Could not register connection, closing socket");
        state.hub.unregister(&connection_id);
        return;
    }

    info!(connection_id = %connection_id, "Client connected");

    let (mut sender, mut receiver) = socket.split();
    let period = state.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            outgoing = outbox.recv() => {
                match outgoing {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => debug!(connection_id = %connection_id, "Ignoring client frame"),
                }
            }
        }
    }

    state.hub.unregister(&connection_id);

    let disconnected = ConnectionEvent::Disconnected {
        connection_id: connection_id.clone(),
    };
    state
        .dispatcher
        .dispatch(state.registry.as_ref(), &disconnected)
        .await;

    info!(connection_id = %connection_id, "Client disconnected");
}
