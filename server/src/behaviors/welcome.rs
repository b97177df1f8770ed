//! # Welcome Behavior
//!
//! Handles the `welcome` envelope this node receives after dialing out to a
//! gateway. The welcome carries the verifier's nonce; the dialer answers
//! with its own nonce and the handshake hash over both.

use std::sync::Arc;

use relay_protocol::{handshake_hash, AuthGatewayMessage, Envelope, MessageType, WelcomeMessage, Wrapping};
use tracing::debug;

use crate::error::BehaviorError;
use crate::socket::{ConnectionState, SocketState};
use crate::state::AppState;

use super::auth_gateway::fresh_nonce;

pub async fn run(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
) -> Result<(), BehaviorError> {
    if socket.state() != ConnectionState::GatewayUnauth {
        return Err(BehaviorError::policy("Unexpected welcome"));
    }

    let welcome: WelcomeMessage = envelope.payload_as()?;
    let verifier_nonce = welcome
        .nonce
        .ok_or_else(|| BehaviorError::policy("Welcome without a handshake nonce"))?;
    let psk = app
        .config
        .gateway_pre_shared_key
        .as_deref()
        .ok_or_else(|| BehaviorError::policy("Gateway features are not configured"))?;

    debug!(
        connection = %socket.connection_id,
        peer = %welcome.machine_name,
        "Gateway welcome received, answering handshake"
    );

    let nonce = fresh_nonce();
    let hash = handshake_hash(psk, &verifier_nonce, &nonce);
    let reply = Envelope::new(MessageType::AuthGateway)
        .from_id(app.instance_id())
        .with_payload(&AuthGatewayMessage { nonce, hash })?;
    socket.send(&reply, Wrapping::PlainText)?;
    Ok(())
}
