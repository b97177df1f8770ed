//! # Command Behavior
//!
//! Routes a portal's command to its agent, and an agent's reply back to the
//! portal. Routing order is the same in both directions: a gateway peer
//! matching the target's registry row, then a locally-attached target, then
//! failure. Tenants never mix — a target that resolves to another tenant's
//! stream closes both ends.

use std::sync::Arc;

use relay_protocol::{Envelope, MessageType, Wrapping};
use tracing::debug;

use crate::behaviors::{deny_access, proxy};
use crate::error::BehaviorError;
use crate::socket::{ConnectionState, SocketRole, SocketState};
use crate::state::AppState;

pub async fn run(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
) -> Result<(), BehaviorError> {
    match socket.state() {
        ConnectionState::PortalAuth => route(app, socket, envelope, SocketRole::Agent).await,
        ConnectionState::AgentAuth => route(app, socket, envelope, SocketRole::Portal).await,
        _ => Err(BehaviorError::policy("Unexpected command")),
    }
}

/// One direction of the relay: a portal targets an agent, an agent's reply
/// targets a portal.
async fn route(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
    target_role: SocketRole,
) -> Result<(), BehaviorError> {
    let organization_id = socket
        .organization_id()
        .ok_or_else(|| BehaviorError::policy("Unexpected command"))?;
    let sender_id = socket
        .client_id()
        .ok_or_else(|| BehaviorError::policy("Unexpected command"))?;
    let target = envelope
        .to
        .clone()
        .filter(|to| !to.is_empty())
        .ok_or_else(|| BehaviorError::policy("Command without a target"))?;

    // A locally-attached stream with the target's id but another tenant is a
    // cross-tenant attempt: both ends close.
    let local_by_id = app.directory.first_client_where(|s| {
        s.is_authenticated() && s.client_id().as_deref() == Some(target.as_str())
    });
    if let Some(local) = &local_by_id {
        if local.organization_id().as_deref() != Some(organization_id.as_str()) {
            return Err(deny_access(app, Some(local.as_ref())));
        }
    }

    // An impersonated portal is denied the same way, whatever the target.
    if socket.impersonated() {
        return Err(deny_access(app, local_by_id.as_deref()));
    }

    let records = match target_role {
        SocketRole::Agent => app.registry.get_agents(&organization_id).await,
        _ => app.registry.get_portals(&organization_id).await,
    };
    let record = records.into_iter().find(|r| r.client_id == target);

    // Rule 1: the target's terminating node is a gateway peer of ours.
    if let Some(record) = &record {
        if let Some(gateway_id) = record.gateway_id.as_deref() {
            if gateway_id != app.instance_id() {
                if let Some(peer) = app.directory.find_gateway_peer(gateway_id) {
                    proxy::forward(
                        app,
                        &peer,
                        MessageType::Command,
                        &sender_id,
                        &target,
                        &organization_id,
                        envelope.payload.clone(),
                        envelope.message_id.clone(),
                    )?;
                    return Ok(());
                }
            }
        }
    }

    // Rule 2: the target is attached to this node.
    if let Some(local) = app
        .directory
        .find_local_client(&organization_id, &target, target_role)
    {
        let wrapping = super::send_wrapping(target_role);
        local.send(&envelope, wrapping)?;
        return Ok(());
    }

    // Replies can still chase the peer that forwarded the request here even
    // when the registry row has gone stale.
    if target_role == SocketRole::Portal {
        let peers = app.directory.where_relevant_to(&organization_id, &target);
        if !peers.is_empty() {
            for peer in peers {
                if let Err(e) = proxy::forward(
                    app,
                    &peer,
                    MessageType::Command,
                    &sender_id,
                    &target,
                    &organization_id,
                    envelope.payload.clone(),
                    envelope.message_id.clone(),
                ) {
                    debug!("Reply relay via gateway peer failed: {e}");
                }
            }
            return Ok(());
        }
    }

    // Rule 3: nowhere to go.
    let reply = Envelope::reply_to(&envelope, envelope.message_type)
        .from_id(app.instance_id())
        .with_error("DestinationNotAvailableForRelay");
    let wrapping = match socket.state().socket_role() {
        SocketRole::Agent => Wrapping::Encrypt,
        _ => Wrapping::PlainText,
    };
    socket.send(&reply, wrapping)?;
    Ok(())
}
