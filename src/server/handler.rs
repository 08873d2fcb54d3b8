//! WebSocket connection handlers.
//!
//! Each accepted connection runs `handle_socket`, which drives the
//! per-connection state machine: `ACK`, timed password check, then a pump
//! that turns enqueued broadcasts into outgoing text frames until either
//! side goes away.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{
    Json,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitStream, StreamExt},
};
use serde::Serialize;
use tokio::{sync::mpsc, time::timeout};

use super::{
    protocol::{self, ACK, AuthOutcome, FAIL, READY},
    state::AppState,
};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, StatusCode> {
    // Allocate the id and register before the upgrade completes so the
    // connection is visible to shutdown() from the first instant. Id
    // allocation and registration happen under the one registry lock, so ids
    // stay unique under concurrent accepts. The shutdown check shares that
    // lock: either this registration lands before the shutdown drain and is
    // drained with the rest, or it observes the flag and is rejected.
    let (id, rx) = {
        let mut registry = state.registry.lock().await;
        if state.shutting_down.load(Ordering::SeqCst) {
            tracing::info!("rejecting connection: server is shutting down");
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
        registry.register()
    };
    tracing::info!("connection {} accepted, awaiting auth", id);

    // If the protocol switch itself fails, handle_socket never runs; the
    // entry still has to leave the registry exactly once.
    let failed_state = state.clone();
    Ok(ws
        .on_failed_upgrade(move |error| {
            tracing::warn!("connection {} upgrade failed: {}", id, error);
            tokio::spawn(async move { finish(&failed_state, id).await });
        })
        .on_upgrade(move |socket| handle_socket(socket, state, id, rx)))
}

pub async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    id: u64,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let (mut sink, mut stream) = socket.split();

    // Let the client know we are ready for its password.
    if sink.send(Message::Text(ACK.into())).await.is_err() {
        tracing::warn!("connection {}: failed to send ACK", id);
        finish(&state, id).await;
        return;
    }

    // The client has one auth window to present the password. Dropping the
    // timeout future the moment input arrives is what cancels the timer, so
    // a late expiry can never fire against an authenticated connection. The
    // rx branch only resolves when the registry drops our sender, i.e. the
    // server shut down mid-handshake.
    let granted = tokio::select! {
        first_frame = timeout(state.auth_window, next_text_frame(&mut stream)) => {
            match first_frame {
                Ok(Some(line)) => {
                    protocol::check_password(&line, &state.password) == AuthOutcome::Granted
                }
                Ok(None) => {
                    tracing::info!("connection {} dropped before authenticating", id);
                    finish(&state, id).await;
                    return;
                }
                Err(_) => {
                    // Auth window elapsed. Deliberately no FAIL token: the
                    // client never completed its turn, it only observes the
                    // disconnect.
                    tracing::info!("connection {} timed out awaiting password", id);
                    finish(&state, id).await;
                    return;
                }
            }
        }
        _ = rx.recv() => {
            tracing::info!("connection {} stopped while awaiting auth", id);
            let _ = sink.send(Message::Close(None)).await;
            finish(&state, id).await;
            return;
        }
    };

    if !granted {
        tracing::info!("connection {} presented a wrong password", id);
        // Best effort; the connection is going away either way.
        let _ = sink.send(Message::Text(FAIL.into())).await;
        finish(&state, id).await;
        return;
    }

    if !state.authenticate(id).await {
        // Lost a race with shutdown; the registry entry is already gone.
        finish(&state, id).await;
        return;
    }
    if sink.send(Message::Text(READY.into())).await.is_err() {
        tracing::warn!("connection {}: failed to send READY", id);
        finish(&state, id).await;
        return;
    }
    tracing::info!("connection {} authenticated", id);

    // Pump broadcasts out until either side goes away. The client sends no
    // application data after the handshake; its frames are ignored.
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        tracing::warn!("connection {}: send failed, closing", id);
                        break;
                    }
                }
                None => {
                    // The registry dropped our sender (server shutdown).
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("connection {} closed by peer", id);
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!(
                        "connection {}: ignoring unsolicited frame ({} bytes)",
                        id,
                        text.len()
                    );
                }
                Some(Ok(_)) => {
                    // Ping/pong is answered by the WebSocket layer; binary
                    // frames have no meaning in this protocol.
                }
                Some(Err(e)) => {
                    tracing::warn!("connection {} transport error: {}", id, e);
                    break;
                }
            },
        }
    }

    finish(&state, id).await;
}

/// Wait for the next text frame, skipping control frames.
///
/// Returns `None` on close, stream end, or transport error.
async fn next_text_frame(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

/// Tear a connection down: mark it `Closing`, then remove it from the
/// registry. Every failure path funnels through here; the deregistration is
/// the exactly-once guard, so racing callers (including `shutdown()`) are
/// harmless.
async fn finish(state: &AppState, id: u64) {
    state.begin_close(id).await;
    state.deregister(id).await;
}

#[derive(Serialize)]
pub struct StatsDto {
    pub connections: usize,
    pub authenticated: usize,
}

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Current registry counts (operational probe)
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsDto> {
    let registry = state.registry.lock().await;
    Json(StatsDto {
        connections: registry.len(),
        authenticated: registry.authenticated_count(),
    })
}
