//! # Outbound Gateway Keeper
//!
//! Service-role nodes keep one persistent outward connection per configured
//! gateway. Each keeper dials, runs the standard receive loop over the
//! dialed stream, probes liveness, and redials forever on failure — the
//! fabric heals itself as gateways come and go.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use relay_protocol::{Envelope, MessageType, Wrapping};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::behaviors::lifecycle;
use crate::handlers::process_frame;
use crate::socket::{ConnectionState, OutboundFrame, SocketState, CLOSE_NORMAL};
use crate::state::AppState;
use crate::stats::Stats;

/// Bounded drain for queued frames when a dialed stream winds down.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns one keeper per configured gateway URL.
pub fn spawn_gateway_keepers(app: &AppState) {
    for url in app.config.gateway_server_list() {
        let app = app.clone();
        tokio::spawn(async move {
            run_keeper(app, url).await;
        });
    }
}

/// Dial, serve, redial. Runs until node shutdown.
async fn run_keeper(app: AppState, url: String) {
    info!(%url, "Gateway keeper starting");
    loop {
        if app.shutdown.is_cancelled() {
            return;
        }
        match connect_async(&url).await {
            Ok((stream, _)) => {
                info!(%url, "Gateway connection established");
                run_peer(&app, &url, stream).await;
                warn!(%url, "Gateway connection lost");
            }
            Err(e) => {
                Stats::bump(&app.stats.gateway_failed_attempts);
                warn!(%url, "Gateway dial failed: {e}");
            }
        }
        tokio::select! {
            _ = app.shutdown.cancelled() => return,
            _ = tokio::time::sleep(app.config.reconnect_interval()) => {}
        }
    }
}

/// Runs one established outward connection: writer task, liveness probe and
/// the standard receive loop. The peer's `welcome` kicks off the handshake;
/// the `authgateway` result moves the state to `GatewayAuth`.
async fn run_peer(
    app: &AppState,
    url: &str,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let connection_id = Uuid::new_v4().to_string();
    let (ws_sink, mut ws_stream) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

    let state = Arc::new(SocketState::new(
        connection_id.clone(),
        ConnectionState::GatewayUnauth,
        Arc::clone(&app.keys),
        tx,
        None,
    ));
    app.directory.add_gateway(Arc::clone(&state));

    // ── Writer Task ──
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
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // ── Liveness Probe ──
    // A quiet authenticated peer gets a ping after two intervals without
    // inbound traffic.
    let probe_state = Arc::clone(&state);
    let probe_app = app.clone();
    let probe_task = tokio::spawn(async move {
        let interval = probe_app.config.ping_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if probe_app.config.disable_ping_messages {
                continue;
            }
            if probe_state.state() != ConnectionState::GatewayAuth {
                continue;
            }
            let quiet_for = Utc::now() - probe_state.last_received();
            if quiet_for.num_seconds() >= 2 * interval.as_secs() as i64 {
                let ping = Envelope::new(MessageType::Ping)
                    .from_id(probe_app.instance_id());
                if probe_state.send(&ping, Wrapping::PlainText).is_err() {
                    break;
                }
            }
        }
    });

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
                        if !process_frame(app, &state, text.as_str()).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%url, "Gateway receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // ── Cleanup ──
    probe_task.abort();
    lifecycle::after_disconnect(app, &state).await;
    app.directory.remove_gateway(&connection_id);
    Stats::add(
        &app.stats.bytes_received,
        state.bytes_received.load(Ordering::Relaxed),
    );
    Stats::add(&app.stats.bytes_sent, state.bytes_sent.load(Ordering::Relaxed));
    if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, writer_task).await.is_err() {
        warn!(%url, "Gateway writer drain timed out");
    }
}
