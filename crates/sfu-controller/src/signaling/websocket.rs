//! WebSocket transport for the signaling protocol.
//!
//! One text frame carries one JSON message. Frames that fail to parse are
//! answered with an `INVALID_MESSAGE` error event and otherwise ignored; the
//! connection stays open. Closing the socket cancels the connection actor,
//! which tears the peer session down.

use crate::actors::connection::{ConnectionActor, ConnectionContext};
use crate::signaling::protocol::{parse_client_frame, ServerMessage};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// How long a closed socket waits for its connection actor to finish teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the signaling routes.
#[derive(Clone)]
pub struct SignalingState {
    pub context: ConnectionContext,
    /// Parent token of every connection; cancelled on service shutdown.
    pub shutdown: CancellationToken,
}

/// Router serving the signaling endpoint at `/ws`.
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump one WebSocket until either side closes it.
#[instrument(skip_all, name = "sfu.signaling.ws", fields(connection_id = tracing::field::Empty))]
async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        target: "sfu.signaling.ws",
                        connection_id = %writer_id,
                        message_type = message.type_name(),
                        error = %e,
                        "Failed to serialize server message"
                    );
                }
            }
        }
        let _ = sender.close().await;
    });

    let (handle, actor_task) = ConnectionActor::spawn(
        connection_id.clone(),
        state.context.clone(),
        outbound_tx.clone(),
        state.shutdown.child_token(),
    );

    info!(
        target: "sfu.signaling.ws",
        connection_id = %connection_id,
        "WebSocket connected"
    );

    loop {
        let frame = tokio::select! {
            () = state.shutdown.cancelled() => break,
            frame = receiver.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(
                        target: "sfu.signaling.ws",
                        connection_id = %connection_id,
                        "Ignoring non-UTF-8 binary frame"
                    );
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Err(e)) => {
                debug!(
                    target: "sfu.signaling.ws",
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
        };

        match parse_client_frame(&text) {
            Ok(envelope) => {
                if let Err(e) = handle.submit(envelope).await {
                    warn!(
                        target: "sfu.signaling.ws",
                        connection_id = %connection_id,
                        error = %e,
                        "Connection actor unavailable"
                    );
                    break;
                }
            }
            Err(error_event) => {
                debug!(
                    target: "sfu.signaling.ws",
                    connection_id = %connection_id,
                    "Rejected malformed frame"
                );
                let _ = outbound_tx.send(error_event);
            }
        }
    }

    handle.cancel();
    drop(outbound_tx);

    match tokio::time::timeout(TEARDOWN_TIMEOUT, actor_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(
                target: "sfu.signaling.ws",
                connection_id = %connection_id,
                error = %e,
                "Connection actor task failed"
            );
        }
        Err(_) => {
            warn!(
                target: "sfu.signaling.ws",
                connection_id = %connection_id,
                "Connection teardown timed out"
            );
        }
    }
    writer.abort();

    info!(
        target: "sfu.signaling.ws",
        connection_id = %connection_id,
        "WebSocket disconnected"
    );
}
