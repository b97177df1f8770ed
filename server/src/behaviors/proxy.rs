//! # Proxy Behavior
//!
//! Handles `proxy` envelopes on authenticated gateway connections — the
//! cross-node leg of the fabric. An inner `command` or `control` request is
//! delivered to the locally-attached target; an inner `control` response
//! completes the local pending correlation; an inner `list` pushes fresh
//! agent lists to the tenant's local portals.
//!
//! Receiving a proxy marks `(tenant, inner.from)` in this peer's
//! recent-interest map, so replies addressed to the originator route back
//! through the same peer.

use std::sync::Arc;

use relay_protocol::{ControlResponse, Envelope, MessageType, ProxyMessage};
use tracing::{debug, warn};

use crate::behaviors::{list, send_wrapping};
use crate::error::BehaviorError;
use crate::pending::pending_key;
use crate::socket::{ConnectionState, SocketState};
use crate::state::AppState;
use crate::stats::Stats;

pub async fn run(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
) -> Result<(), BehaviorError> {
    if socket.state() != ConnectionState::GatewayAuth {
        return Err(BehaviorError::policy("Unexpected proxy"));
    }

    let proxy: ProxyMessage = match envelope.payload_as() {
        Ok(proxy) => proxy,
        Err(_) => {
            Stats::bump(&app.stats.invalid_proxy_payloads);
            return Ok(());
        }
    };
    if !matches!(
        proxy.message_type,
        MessageType::Command | MessageType::Control | MessageType::List
    ) {
        Stats::bump(&app.stats.invalid_proxy_payloads);
        return Ok(());
    }

    socket
        .interest
        .mark_interest(&proxy.organization_id, &proxy.from);

    match proxy.message_type {
        MessageType::Command => relay_command(app, proxy, envelope.message_id).await,
        MessageType::Control => relay_control(app, proxy, envelope.message_id).await,
        MessageType::List => push_lists(app, proxy).await,
        _ => Ok(()),
    }
}

/// Delivers a proxied command (or a proxied command reply) to the
/// locally-attached target.
async fn relay_command(
    app: &AppState,
    proxy: ProxyMessage,
    message_id: Option<String>,
) -> Result<(), BehaviorError> {
    let Some(local) = app.directory.first_client_where(|s| {
        s.is_authenticated() && s.client_id().as_deref() == Some(proxy.to.as_str())
    }) else {
        debug!(target = %proxy.to, "Proxied command for a client not attached here");
        return Ok(());
    };

    if local.organization_id().as_deref() != Some(proxy.organization_id.as_str()) {
        warn!(target = %proxy.to, "Proxied command with a tenant mismatch, dropping");
        Stats::bump(&app.stats.invalid_proxy_payloads);
        return Ok(());
    }

    let inner = Envelope {
        from: Some(proxy.from),
        to: Some(proxy.to),
        message_type: MessageType::Command,
        message_id,
        payload: proxy.inner_message,
        error_message: None,
    };
    local.send(&inner, send_wrapping(local.state().socket_role()))?;
    Ok(())
}

/// A proxied control envelope is either a response coming back (a pending
/// correlation exists for it) or a request on its way to a local agent.
async fn relay_control(
    app: &AppState,
    proxy: ProxyMessage,
    message_id: Option<String>,
) -> Result<(), BehaviorError> {
    let Some(message_id) = message_id else {
        Stats::bump(&app.stats.invalid_proxy_payloads);
        return Ok(());
    };

    let key = pending_key(&proxy.organization_id, &proxy.from, &message_id);
    if app.pending.contains(&key) {
        let response: ControlResponse = match proxy
            .inner_message
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
        {
            Ok(Some(response)) => response,
            _ => {
                Stats::bump(&app.stats.invalid_proxy_payloads);
                return Ok(());
            }
        };
        app.pending.complete(&key, response);
        return Ok(());
    }

    // No waiter here: it is a request for an agent attached to this node.
    let Some(agent) = app.directory.first_client_where(|s| {
        s.is_authenticated() && s.client_id().as_deref() == Some(proxy.to.as_str())
    }) else {
        debug!(target = %proxy.to, "Proxied control for a client not attached here");
        return Ok(());
    };
    if agent.organization_id().as_deref() != Some(proxy.organization_id.as_str()) {
        warn!(target = %proxy.to, "Proxied control with a tenant mismatch, dropping");
        Stats::bump(&app.stats.invalid_proxy_payloads);
        return Ok(());
    }

    let inner = Envelope {
        from: Some(proxy.from),
        to: Some(proxy.to),
        message_type: MessageType::Control,
        message_id: Some(message_id),
        payload: proxy.inner_message,
        error_message: None,
    };
    agent.send(&inner, send_wrapping(agent.state().socket_role()))?;
    Ok(())
}

/// Pushes a fresh agent list to every local portal of the tenant.
async fn push_lists(app: &AppState, proxy: ProxyMessage) -> Result<(), BehaviorError> {
    for portal in app.directory.local_portals(&proxy.organization_id) {
        let Some(portal_id) = portal.client_id() else {
            continue;
        };
        let request = list::synthesized_request(&portal_id);
        if let Err(e) = list::run(app, &portal, request).await {
            debug!(portal = %portal_id, "List push failed: {e}");
        }
    }
    Ok(())
}

/// Wraps a request in a proxy envelope and sends it to a gateway peer,
/// recording the target pair in the peer's recent-interest map. The outer
/// `messageId` carries the correlation across nodes.
pub(crate) fn forward(
    app: &AppState,
    peer: &SocketState,
    inner_type: MessageType,
    from: &str,
    to: &str,
    organization_id: &str,
    inner_message: Option<String>,
    message_id: Option<String>,
) -> Result<(), BehaviorError> {
    let proxy = ProxyMessage {
        message_type: inner_type,
        from: from.to_string(),
        to: to.to_string(),
        organization_id: organization_id.to_string(),
        inner_message,
    };
    let mut outer = Envelope::new(MessageType::Proxy).from_id(app.instance_id());
    outer.to = peer.client_id();
    if message_id.is_some() {
        outer.message_id = message_id;
    }
    let outer = outer.with_payload(&proxy)?;
    peer.send(&outer, relay_protocol::Wrapping::PlainText)?;
    peer.interest.mark_interest(organization_id, to);
    Ok(())
}
