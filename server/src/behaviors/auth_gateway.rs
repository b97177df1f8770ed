//! # Gateway Handshake Behavior
//!
//! Second and third legs of the gateway handshake. The ingress side issued a
//! nonce in its `welcome`; the dialer answers with `authgateway` carrying its
//! own nonce and the HMAC over both, keyed by the pre-shared key. The
//! verifier recomputes the hash and, on a match, replies with an accepted
//! result so the dialer can mark its own side authenticated.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use relay_protocol::{
    handshake_hash, AuthGatewayMessage, AuthResultMessage, Envelope, MessageType, Wrapping,
};
use tracing::info;

use crate::error::BehaviorError;
use crate::socket::{ConnectionState, SocketState};
use crate::state::AppState;

/// 32 random bytes, base64. Issued in welcomes and handshake replies.
pub fn fresh_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

pub async fn run(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
) -> Result<(), BehaviorError> {
    if socket.state() != ConnectionState::GatewayUnauth {
        return Err(BehaviorError::policy("Unexpected gateway handshake"));
    }

    // The verifier side holds the nonce it issued in its welcome; the dialer
    // side holds none and is waiting for the result envelope instead.
    match socket.issued_nonce() {
        Some(issued) => verify(app, socket, envelope, &issued).await,
        None => accept_result(app, socket, envelope).await,
    }
}

/// Ingress side: checks the dialer's hash against the issued nonce.
async fn verify(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
    issued_nonce: &str,
) -> Result<(), BehaviorError> {
    let message: AuthGatewayMessage = envelope.payload_as()?;
    let peer_id = envelope
        .from
        .clone()
        .filter(|from| !from.is_empty())
        .ok_or_else(|| BehaviorError::policy("Gateway handshake without a sender id"))?;
    let psk = app
        .config
        .gateway_pre_shared_key
        .as_deref()
        .ok_or_else(|| BehaviorError::policy("Gateway features are not configured"))?;

    let expected = handshake_hash(psk, issued_nonce, &message.nonce);
    if expected != message.hash {
        return Err(BehaviorError::policy("Incorrect gateway handshake"));
    }

    socket.set_peer_identity(peer_id.clone());
    socket.set_state(ConnectionState::GatewayAuth);
    info!(
        connection = %socket.connection_id,
        peer = %peer_id,
        "Gateway peer authenticated"
    );

    let reply = Envelope::reply_to(&envelope, MessageType::AuthGateway)
        .from_id(app.instance_id())
        .with_payload(&AuthResultMessage {
            accepted: true,
            will_replace_token: false,
            new_token: None,
        })?;
    socket.send(&reply, Wrapping::PlainText)?;
    Ok(())
}

/// Dialer side: the verifier's verdict on the hash we sent.
async fn accept_result(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
) -> Result<(), BehaviorError> {
    let result: AuthResultMessage = envelope.payload_as()?;
    if !result.accepted {
        return Err(BehaviorError::policy("Gateway handshake rejected"));
    }
    let peer_id = envelope
        .from
        .clone()
        .filter(|from| !from.is_empty())
        .ok_or_else(|| BehaviorError::policy("Gateway handshake without a sender id"))?;

    socket.set_peer_identity(peer_id.clone());
    socket.set_state(ConnectionState::GatewayAuth);
    // A live handshake means the dial loop is healthy again.
    app.stats
        .gateway_failed_attempts
        .store(0, std::sync::atomic::Ordering::Relaxed);
    info!(
        connection = %socket.connection_id,
        peer = %peer_id,
        "Outward gateway connection authenticated"
    );
    Ok(())
}
