//! # Ping / Pong Behavior
//!
//! Liveness probes from any authenticated peer. A ping refreshes the
//! sender's registry activity stamp and gets a `pong` back; agents also get
//! an activity event published for the backend.

use std::sync::Arc;

use chrono::Utc;
use relay_protocol::{Envelope, MessageType, Wrapping};
use tracing::debug;

use crate::bus::{AgentActivityMessage, AgentActivityType};
use crate::error::BehaviorError;
use crate::socket::{SocketRole, SocketState};
use crate::state::AppState;

pub async fn run_ping(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
) -> Result<(), BehaviorError> {
    if !socket.is_authenticated() {
        return Err(BehaviorError::policy("Unexpected ping"));
    }

    let identity = socket.identity();
    if let (Some(client_id), Some(organization_id)) =
        (&identity.client_id, &identity.organization_id)
    {
        // Gateway peers have no registry row; only clients do.
        if matches!(
            socket.state().socket_role(),
            SocketRole::Agent | SocketRole::Portal
        ) && !app.registry.update_activity(client_id, organization_id).await
        {
            debug!(client = %client_id, "Ping for a client with no registry row");
        }
    }

    if socket.state().socket_role() == SocketRole::Agent {
        let _ = app
            .bus
            .publish_agent_activity(AgentActivityMessage {
                activity_type: AgentActivityType::Ping,
                connected_on: socket.connected_on,
                registered_agent_id: identity.registered_agent_id,
                organization_id: identity.organization_id,
                client_version: identity.client_version,
                metadata: None,
            })
            .await;
    }

    let mut pong = Envelope::new(MessageType::Pong).from_id(app.instance_id());
    pong.to = envelope.from.clone();
    socket.send(&pong, Wrapping::PlainText)?;
    Ok(())
}

pub async fn run_pong(
    _app: &AppState,
    socket: &Arc<SocketState>,
    _envelope: Envelope,
) -> Result<(), BehaviorError> {
    if !socket.is_authenticated() {
        return Err(BehaviorError::policy("Unexpected pong"));
    }
    // Receipt alone refreshed the connection's activity stamp.
    Ok(())
}
