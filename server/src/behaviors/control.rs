//! # Control Behavior
//!
//! Handles a `control` envelope from an authenticated agent: the reply to a
//! backend-originated control request. If the request was issued on this
//! node the pending correlation completes here; otherwise the reply is
//! relayed to whichever gateway peers recently forwarded traffic for this
//! agent, and the node that holds the correlation completes it.

use std::sync::Arc;

use relay_protocol::{ControlResponse, Envelope, MessageType};
use tracing::debug;

use crate::behaviors::proxy;
use crate::error::BehaviorError;
use crate::pending::pending_key;
use crate::socket::{ConnectionState, SocketState};
use crate::state::AppState;

pub async fn run(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
) -> Result<(), BehaviorError> {
    if socket.state() != ConnectionState::AgentAuth {
        return Err(BehaviorError::policy("Unexpected control"));
    }
    let organization_id = socket
        .organization_id()
        .ok_or_else(|| BehaviorError::policy("Unexpected control"))?;
    let client_id = socket
        .client_id()
        .ok_or_else(|| BehaviorError::policy("Unexpected control"))?;
    let message_id = envelope
        .message_id
        .clone()
        .ok_or_else(|| BehaviorError::policy("Control without a correlation id"))?;

    let response: ControlResponse = envelope.payload_as()?;

    let key = pending_key(&organization_id, &client_id, &message_id);
    if app.pending.complete(&key, response) {
        return Ok(());
    }

    // The correlation lives on another node; send the reply back through
    // the peers that recently proxied traffic for this agent.
    let peers = app.directory.where_relevant_to(&organization_id, &client_id);
    if peers.is_empty() {
        debug!(
            client = %client_id,
            "Control response with no local waiter and no relevant gateway peer"
        );
        return Ok(());
    }
    for peer in peers {
        if let Err(e) = proxy::forward(
            app,
            &peer,
            MessageType::Control,
            &client_id,
            envelope.to.as_deref().unwrap_or("unknown"),
            &organization_id,
            envelope.payload.clone(),
            Some(message_id.clone()),
        ) {
            debug!("Control relay via gateway peer failed: {e}");
        }
    }
    Ok(())
}
