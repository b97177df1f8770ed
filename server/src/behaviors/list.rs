//! # List Behavior
//!
//! Answers a portal's `list` with the tenant's live agents. The same
//! behavior backs the push path: agent connect/disconnect hooks synthesize a
//! `list` envelope per portal and run it here, so pushed and requested lists
//! are built identically.

use std::sync::Arc;

use relay_protocol::{Envelope, MessageType, Wrapping};

use crate::error::BehaviorError;
use crate::socket::{ConnectionState, SocketState};
use crate::state::AppState;

pub async fn run(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
) -> Result<(), BehaviorError> {
    if socket.state() != ConnectionState::PortalAuth {
        return Err(BehaviorError::policy("Unexpected list"));
    }
    let organization_id = socket
        .organization_id()
        .ok_or_else(|| BehaviorError::policy("Unexpected list"))?;

    // Inactive rows are already filtered by the registry's liveness window.
    let agents = app.registry.get_agents(&organization_id).await;

    let reply = Envelope::reply_to(&envelope, MessageType::List)
        .from_id(app.instance_id())
        .with_payload(&agents)?;
    socket.send(&reply, Wrapping::PlainText)?;
    Ok(())
}

/// Builds the synthesized request the push path feeds into [`run`].
pub fn synthesized_request(portal_client_id: &str) -> Envelope {
    Envelope::new(MessageType::List).from_id(portal_client_id)
}
