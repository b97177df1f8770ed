//! # Agent Authentication Behavior
//!
//! An agent's `auth` arrives Sign-Only, signed with the key whose public
//! half rides inside the payload. The behavior checks the protocol version,
//! proves key possession against the frame's own signature, validates the
//! token through the backend, and on success stores the key — which is what
//! flips the connection's inbound wrapping to Encrypt.

use std::sync::Arc;

use relay_protocol::{
    wrapping, AuthMessage, AuthResultMessage, ClientType, Envelope, MessageType, PeerPublicKey,
    Wrapping,
};
use tracing::{info, warn};

use crate::behaviors::lifecycle;
use crate::error::BehaviorError;
use crate::registry::NewRegistration;
use crate::socket::{ConnectionState, SocketState};
use crate::state::AppState;

pub async fn run(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
    raw: &str,
) -> Result<(), BehaviorError> {
    if !matches!(
        socket.state(),
        ConnectionState::AgentUnauth | ConnectionState::AgentAuth
    ) {
        return Err(BehaviorError::policy("Unexpected auth"));
    }

    let auth: AuthMessage = envelope
        .payload_as()
        .map_err(|_| BehaviorError::policy("Invalid authentication payload"))?;
    if auth.token.is_empty() {
        return Err(BehaviorError::policy("Invalid authentication payload"));
    }
    let client_id = envelope
        .from
        .clone()
        .filter(|from| !from.is_empty())
        .ok_or_else(|| BehaviorError::policy("Invalid authentication payload"))?;

    let protocol_version = auth
        .protocol_version
        .ok_or_else(|| BehaviorError::policy("Invalid protocol version"))?;
    if !app
        .config
        .allowed_protocol_versions
        .contains(&protocol_version)
    {
        return Err(BehaviorError::policy("Invalid protocol version"));
    }

    let pem = auth
        .public_key
        .as_deref()
        .ok_or_else(|| BehaviorError::policy("Invalid authentication payload"))?;
    let peer_key = PeerPublicKey::from_pem(pem)
        .map_err(|_| BehaviorError::policy("Invalid authentication payload"))?;

    // On first auth the frame was decoded without verification because the
    // key only just arrived; prove possession against the frame itself.
    // Re-auth frames arrive Encrypt, not Sign-Only, so skip the check there.
    if socket.state() == ConnectionState::AgentUnauth {
        wrapping::verify_signed(raw, &peer_key)?;
    }

    let validation = match app.bus.validate_agent_token(&auth.token).await {
        Ok(validation) => validation,
        Err(e) => {
            warn!("Agent token validation unavailable: {e}");
            reply(app, socket, &envelope, false, None)?;
            return Ok(());
        }
    };

    if !validation.success {
        info!(
            connection = %socket.connection_id,
            "Agent authentication rejected: {}",
            validation.message.as_deref().unwrap_or("invalid token")
        );
        reply(app, socket, &envelope, false, None)?;
        return Ok(());
    }

    let organization_id = validation
        .organization_id
        .filter(|org| !org.is_empty())
        .ok_or_else(|| BehaviorError::policy("Invalid authentication payload"))?;

    socket.apply_auth(
        client_id.clone(),
        organization_id.clone(),
        validation.expires,
        auth.client_version.clone(),
        validation.registered_agent_id.clone(),
    )?;
    socket.set_peer_key(peer_key);

    // The result goes out Sign-Only; only afterwards does the connection
    // expect (and receive) Encrypt traffic.
    reply(app, socket, &envelope, true, validation.new_token.clone())?;
    socket.set_state(ConnectionState::AgentAuth);

    let registered = app
        .registry
        .register(NewRegistration {
            client_type: ClientType::Agent,
            connection_id: socket.connection_id.clone(),
            client_id: client_id.clone(),
            organization_id: organization_id.clone(),
            registered_agent_id: validation.registered_agent_id,
            client_version: auth.client_version,
            gateway_id: Some(app.instance_id().to_string()),
            client_ip: socket.client_ip.clone(),
        })
        .await;
    if !registered {
        warn!(client = %client_id, "Agent registration write failed");
    }

    info!(
        connection = %socket.connection_id,
        client = %client_id,
        organization = %organization_id,
        "Agent authenticated"
    );
    lifecycle::after_authenticated(app, socket, auth.metadata).await;
    Ok(())
}

/// The `auth` result, signed by this node.
fn reply(
    app: &AppState,
    socket: &SocketState,
    request: &Envelope,
    accepted: bool,
    new_token: Option<String>,
) -> Result<(), BehaviorError> {
    let will_replace_token = new_token.is_some();
    let reply = Envelope::reply_to(request, MessageType::Auth)
        .from_id(app.instance_id())
        .with_payload(&AuthResultMessage {
            accepted,
            will_replace_token,
            new_token,
        })?;
    socket.send(&reply, Wrapping::SignOnly)
}
