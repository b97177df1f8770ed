//! # Connection Lifecycle Hooks
//!
//! Side effects around an agent joining or any client leaving: activity
//! events on the bus, registry cleanup, and list pushes so every portal of
//! the tenant — local or behind a gateway peer — sees the fresh agent set.
//! Everything here is best-effort; a failed push never fails the trigger.

use std::sync::Arc;

use relay_protocol::MessageType;
use tracing::debug;

use crate::behaviors::{list, proxy};
use crate::bus::{AgentActivityMessage, AgentActivityType};
use crate::error::BehaviorError;
use crate::socket::{SocketRole, SocketState};
use crate::state::AppState;
use crate::stats::Stats;

/// Runs after an agent authenticates: announce it and push fresh lists.
pub async fn after_authenticated(
    app: &AppState,
    socket: &Arc<SocketState>,
    metadata: Option<serde_json::Value>,
) {
    let identity = socket.identity();
    if socket.state().socket_role() == SocketRole::Agent {
        let _ = app
            .bus
            .publish_agent_activity(AgentActivityMessage {
                activity_type: AgentActivityType::Connected,
                connected_on: socket.connected_on,
                registered_agent_id: identity.registered_agent_id.clone(),
                organization_id: identity.organization_id.clone(),
                client_version: identity.client_version.clone(),
                metadata,
            })
            .await;
    }
    if let Some(organization_id) = identity.organization_id {
        push_tenant_lists(app, &organization_id).await;
    }
}

/// Runs when a stream goes away: deregister, announce, push fresh lists.
pub async fn after_disconnect(app: &AppState, socket: &Arc<SocketState>) {
    Stats::bump(&app.stats.connections_closed);

    if !socket.is_authenticated() {
        return;
    }
    let identity = socket.identity();
    let (Some(client_id), Some(organization_id)) =
        (identity.client_id.clone(), identity.organization_id.clone())
    else {
        return;
    };

    // Gateway peers have no registry row and no tenant to notify.
    let role = socket.state().socket_role();
    if role == SocketRole::Gateway {
        return;
    }

    app.registry
        .deregister(
            &socket.connection_id,
            &client_id,
            &organization_id,
            socket.bytes_received.load(std::sync::atomic::Ordering::Relaxed),
            socket.bytes_sent.load(std::sync::atomic::Ordering::Relaxed),
        )
        .await;

    if role == SocketRole::Agent {
        let _ = app
            .bus
            .publish_agent_activity(AgentActivityMessage {
                activity_type: AgentActivityType::Disconnected,
                connected_on: socket.connected_on,
                registered_agent_id: identity.registered_agent_id,
                organization_id: Some(organization_id.clone()),
                client_version: identity.client_version,
                metadata: None,
            })
            .await;
        push_tenant_lists(app, &organization_id).await;
    }
}

/// Pushes a fresh agent list to every portal of the tenant: locally-attached
/// portals get it directly, portals behind gateway peers get a proxied
/// `list` trigger. A single slow or broken portal only loses its own push.
pub async fn push_tenant_lists(app: &AppState, organization_id: &str) {
    for portal in app.directory.local_portals(organization_id) {
        let Some(portal_id) = portal.client_id() else {
            continue;
        };
        let request = list::synthesized_request(&portal_id);
        if let Err(e) = list::run(app, &portal, request).await {
            debug!(portal = %portal_id, "List push failed: {e}");
        }
    }

    for record in app.registry.get_portals(organization_id).await {
        let Some(gateway_id) = record.gateway_id.as_deref() else {
            continue;
        };
        if gateway_id == app.instance_id() {
            continue;
        }
        let Some(peer) = app.directory.find_gateway_peer(gateway_id) else {
            continue;
        };
        if let Err(e) = forward_list_trigger(app, &peer, &record.client_id, organization_id) {
            debug!(portal = %record.client_id, "List push via gateway peer failed: {e}");
        }
    }
}

fn forward_list_trigger(
    app: &AppState,
    peer: &SocketState,
    portal_id: &str,
    organization_id: &str,
) -> Result<(), BehaviorError> {
    proxy::forward(
        app,
        peer,
        MessageType::List,
        app.instance_id(),
        portal_id,
        organization_id,
        None,
        None,
    )
}
