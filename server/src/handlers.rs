//! # WebSocket Handlers
//!
//! Contains the core WebSocket logic for the relay node:
//! - Upgrading HTTP connections on `/portal`, `/agent` and `/gateway`
//! - Managing the lifecycle of each stream (inbound/outbound tasks, cleanup)
//! - The framed receive loop: size caps, wrapping inference, dispatch
//! - Policy-violation closes and the graceful shutdown drain

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use relay_protocol::{wrapping, Envelope, MessageType, WelcomeMessage, Wrapping};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::behaviors::{self, auth_gateway, lifecycle};
use crate::socket::{
    ConnectionState, OutboundFrame, SocketState, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
use crate::state::AppState;
use crate::stats::Stats;

/// Upper bound on the graceful drain of queued outbound frames.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ─── WebSocket Upgrade Endpoints ────────────────────────────────

/// `GET /portal` — portal ingress.
pub async fn portal_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(app): State<AppState>,
) -> Response {
    upgrade(ws, addr, app, ConnectionState::PortalUnauth)
}

/// `GET /agent` — agent ingress.
pub async fn agent_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(app): State<AppState>,
) -> Response {
    upgrade(ws, addr, app, ConnectionState::AgentUnauth)
}

/// `GET /gateway` — gateway peer ingress (gateway role only).
pub async fn gateway_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(app): State<AppState>,
) -> Response {
    upgrade(ws, addr, app, ConnectionState::GatewayUnauth)
}

/// Shared upgrade: the ingress path fixes the stream's initial state.
fn upgrade(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    addr: SocketAddr,
    app: AppState,
    initial_state: ConnectionState,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "Only websocket clients are allowed")
                .into_response()
        }
    };
    // The policy caps in the receive loop are authoritative; the socket
    // layer just needs to be no tighter than they are.
    let socket_cap = app
        .config
        .websocket_receive_buffer_size
        .max(app.config.max_message_size as usize)
        .max(app.config.max_bytes_before_authentication as usize)
        + 1024;
    ws.max_message_size(socket_cap)
        .on_upgrade(move |socket| handle_connection(socket, app, initial_state, addr))
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Manages the full lifecycle of one accepted stream.
///
/// ## Flow:
/// 1. Assign a connection id and build the [`SocketState`]
/// 2. Register it in the local directory
/// 3. Send the `welcome` envelope (with a handshake nonce on `/gateway`)
/// 4. Spawn the writer task that drains the outbound queue
/// 5. Run the receive loop until close, violation or shutdown
/// 6. Run the after-disconnect hook and clean up
async fn handle_connection(
    socket: WebSocket,
    app: AppState,
    initial_state: ConnectionState,
    addr: SocketAddr,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!(connection = %connection_id, peer = %addr, "New connection");
    Stats::bump(&app.stats.connections_accepted);

    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

    let state = Arc::new(SocketState::new(
        connection_id.clone(),
        initial_state,
        Arc::clone(&app.keys),
        tx,
        Some(addr.ip().to_string()),
    ));

    let is_gateway_ingress = initial_state == ConnectionState::GatewayUnauth;
    if is_gateway_ingress {
        app.directory.add_gateway(Arc::clone(&state));
    } else {
        app.directory.add_client(Arc::clone(&state));
    }

    // ── Writer Task ──
    // The single consumer of the outbound queue; this is what makes sends
    // on one stream atomic on the wire.
    let ws_sink = Arc::new(tokio::sync::Mutex::new(ws_sink));
    let ws_sink_writer = Arc::clone(&ws_sink);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut sink = ws_sink_writer.lock().await;
            match frame {
                OutboundFrame::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // ── Welcome ──
    if let Err(e) = send_welcome(&app, &state, is_gateway_ingress) {
        warn!(connection = %connection_id, "Welcome send failed: {e}");
    }

    // ── Receive Loop ──
    loop {
        tokio::select! {
            _ = app.shutdown.cancelled() => {
                state.close(CLOSE_NORMAL, "Server shutting down");
                break;
            }
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !process_frame(&app, &state, text.as_str()).await {
                            break;
                        }
                    }
                    // Binary frames are ignored; control frames are handled
                    // by the socket layer.
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection = %connection_id, "Receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // ── Cleanup on Disconnect ──
    info!(connection = %connection_id, "Disconnecting");
    lifecycle::after_disconnect(&app, &state).await;
    if is_gateway_ingress {
        app.directory.remove_gateway(&connection_id);
    } else {
        app.directory.remove_client(&connection_id);
    }
    Stats::add(
        &app.stats.bytes_received,
        state.bytes_received.load(Ordering::Relaxed),
    );
    Stats::add(&app.stats.bytes_sent, state.bytes_sent.load(Ordering::Relaxed));

    // Give queued frames (including a close frame) a bounded chance to
    // drain, then cut the writer loose.
    if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, writer_task).await.is_err() {
        warn!(connection = %connection_id, "Writer drain timed out");
    }
}

/// Builds and sends the `welcome` envelope for a fresh stream. Gateway
/// ingress gets a handshake nonce, remembered for hash verification.
fn send_welcome(
    app: &AppState,
    state: &Arc<SocketState>,
    is_gateway_ingress: bool,
) -> Result<(), crate::error::BehaviorError> {
    let nonce = if is_gateway_ingress {
        let nonce = auth_gateway::fresh_nonce();
        state.set_issued_nonce(nonce.clone());
        Some(nonce)
    } else {
        None
    };
    let welcome = Envelope::new(MessageType::Welcome)
        .from_id(app.instance_id())
        .with_payload(&WelcomeMessage {
            public_key_hash: app.keys.fingerprint().to_string(),
            machine_name: app.instance_id().to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            nonce,
            allowed_protocol_versions: app.config.allowed_protocol_versions.clone(),
        })?;
    state.send(&welcome, Wrapping::PlainText)
}

// ─── Frame Processing ───────────────────────────────────────────

/// Handles one inbound text frame. Returns `false` when the loop must end
/// (the close frame is already queued by then).
pub async fn process_frame(app: &AppState, state: &Arc<SocketState>, text: &str) -> bool {
    state.touch_received(text.len() as u64);

    // Size caps: a running total before authentication, a per-frame cap
    // after.
    if !state.is_authenticated() {
        if state.bytes_received.load(Ordering::Relaxed) > app.config.max_bytes_before_authentication
        {
            return policy_close(app, state, "Too much data before authentication");
        }
    } else if text.len() as u64 > app.config.max_message_size {
        return policy_close(app, state, "Message too large");
    }

    // The connection state dictates the only wrapping this frame may carry.
    let expected = state.state().expected_wrapping();
    let sender_key = state.peer_key();
    let json = match wrapping::unwrap_text(text, expected, &app.keys, sender_key.as_ref()) {
        Ok(json) => json,
        Err(e) => {
            debug!(connection = %state.connection_id, "Frame rejected: {e}");
            return policy_close(app, state, &e.to_string());
        }
    };
    let envelope = match serde_json::from_str::<Envelope>(&json) {
        Ok(envelope) => envelope,
        Err(_) => {
            // A well-wrapped JSON object with a missing or unknown `type`
            // has no handler; log it and move on. Anything else is a
            // malformed envelope.
            if serde_json::from_str::<serde_json::Value>(&json)
                .map(|v| v.is_object())
                .unwrap_or(false)
            {
                debug!(connection = %state.connection_id, "Frame without a usable type, ignored");
                return true;
            }
            return policy_close(app, state, "malformed envelope");
        }
    };

    // An expired token gets a warning, then the same close as any violation.
    if state.token_expired() {
        let warning = Envelope::new(MessageType::Warning)
            .from_id(app.instance_id())
            .with_error("TokenExpired");
        let _ = state.send(&warning, Wrapping::PlainText);
        return policy_close(app, state, "TokenExpired");
    }

    match behaviors::dispatch(app, state, envelope, text).await {
        Ok(()) => true,
        Err(e) if e.closes_stream() => policy_close(app, state, &e.close_reason()),
        Err(e) => {
            // Transient behavior failures never kill the stream.
            error!(connection = %state.connection_id, "Behavior failed: {e}");
            true
        }
    }
}

fn policy_close(app: &AppState, state: &Arc<SocketState>, reason: &str) -> bool {
    warn!(connection = %state.connection_id, "Policy violation: {reason}");
    Stats::bump(&app.stats.policy_violations);
    state.close(CLOSE_POLICY_VIOLATION, reason);
    false
}
