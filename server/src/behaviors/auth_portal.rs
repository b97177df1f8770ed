//! # Portal Authentication Behavior
//!
//! Validates a portal's token through the backend and, on success, tags the
//! connection with the tenant and registers it. A rejected token gets an
//! `accepted=false` reply and the stream stays open; the portal may retry by
//! sending `authportal` again.

use std::sync::Arc;

use relay_protocol::{AuthMessage, AuthResultMessage, ClientType, Envelope, MessageType, Wrapping};
use tracing::{info, warn};

use crate::error::BehaviorError;
use crate::registry::NewRegistration;
use crate::socket::{ConnectionState, SocketState};
use crate::state::AppState;

pub async fn run(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
) -> Result<(), BehaviorError> {
    if !matches!(
        socket.state(),
        ConnectionState::PortalUnauth | ConnectionState::PortalAuth
    ) {
        return Err(BehaviorError::policy("Unexpected authportal"));
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

    let validation = match app.bus.validate_connect_token(&auth.token).await {
        Ok(validation) => validation,
        Err(e) => {
            // The backend being unreachable is the portal's problem only in
            // the sense that it gets a rejection it can retry.
            warn!("Portal token validation unavailable: {e}");
            reply(app, socket, &envelope, false)?;
            return Ok(());
        }
    };

    if !validation.success {
        info!(
            connection = %socket.connection_id,
            "Portal authentication rejected: {}",
            validation.message.as_deref().unwrap_or("invalid token")
        );
        reply(app, socket, &envelope, false)?;
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
        None,
    )?;
    socket.set_state(ConnectionState::PortalAuth);

    let registered = app
        .registry
        .register(NewRegistration {
            client_type: ClientType::Portal,
            connection_id: socket.connection_id.clone(),
            client_id: client_id.clone(),
            organization_id: organization_id.clone(),
            registered_agent_id: None,
            client_version: auth.client_version,
            gateway_id: Some(app.instance_id().to_string()),
            client_ip: socket.client_ip.clone(),
        })
        .await;
    if !registered {
        warn!(client = %client_id, "Portal registration write failed");
    }

    info!(
        connection = %socket.connection_id,
        client = %client_id,
        organization = %organization_id,
        "Portal authenticated"
    );
    reply(app, socket, &envelope, true)?;
    Ok(())
}

/// The `authportal` result, PlainText either way.
fn reply(
    app: &AppState,
    socket: &SocketState,
    request: &Envelope,
    accepted: bool,
) -> Result<(), BehaviorError> {
    let reply = Envelope::reply_to(request, MessageType::AuthPortal)
        .from_id(app.instance_id())
        .with_payload(&AuthResultMessage {
            accepted,
            will_replace_token: false,
            new_token: None,
        })?;
    socket.send(&reply, Wrapping::PlainText)
}
