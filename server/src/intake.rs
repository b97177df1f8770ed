//! # Bus Intake Workers
//!
//! Background workers driven by the message bus:
//! - the control intake, turning `AgentControlCommandRequest`s into relayed
//!   `control` envelopes and correlating the replies,
//! - the daily purge subscriber,
//! - the periodic public-key publication.
//!
//! The control intake always answers, even when the attempt fails — the
//! requester on the other side of the bus is never left hanging.

use rand::Rng;
use relay_protocol::{ControlRequest, Envelope, MessageType, Wrapping};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::behaviors::proxy;
use crate::bus::{AgentControlCommandResponse, ControlDelivery};
use crate::pending::pending_key;
use crate::socket::SocketRole;
use crate::state::AppState;
use crate::stats::Stats;

/// Maximum random delay before acting on a daily purge tick, so replicas
/// sharing the store do not purge in lockstep.
const PURGE_JITTER_SECS: u64 = 30;

/// How often the node's public key goes out on the bus.
const PUBLIC_KEY_INTERVAL_SECS: u64 = 2 * 24 * 60 * 60;

// ─── Control Intake ─────────────────────────────────────────────

/// Consumes control requests from the bus until shutdown. Each request is
/// handled on its own task so a slow agent never blocks the intake.
pub async fn run_control_intake(app: AppState) {
    let mut requests = match app.bus.control_requests().await {
        Ok(requests) => requests,
        Err(e) => {
            warn!("Control intake unavailable: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = app.shutdown.cancelled() => return,
            delivery = requests.recv() => {
                match delivery {
                    Some(delivery) => {
                        let app = app.clone();
                        tokio::spawn(async move {
                            handle_control_request(app, delivery).await;
                        });
                    }
                    None => return,
                }
            }
        }
    }
}

/// Relays one control request to its agent and answers on the bus.
async fn handle_control_request(app: AppState, delivery: ControlDelivery) {
    Stats::bump(&app.stats.bus_control_requests);
    let request = delivery.request.clone();

    // The request names the agent by machine registration id; the registry
    // maps that to the live client and the node terminating it.
    let agent = app
        .registry
        .get_agents(&request.organization_id)
        .await
        .into_iter()
        .find(|row| row.machine_registration_id.as_deref() == Some(request.agent_id.as_str()));

    let Some(agent) = agent else {
        debug!(agent = %request.agent_id, "Control request for an unconnected agent");
        respond_failure(delivery, &request, "Client was not connected");
        return;
    };

    let message_id = Uuid::new_v4().to_string();
    let inner = match serde_json::to_string(&ControlRequest {
        command: request.command.clone(),
        settings: request.settings.clone(),
    }) {
        Ok(inner) => inner,
        Err(e) => {
            respond_failure(delivery, &request, &format!("Invalid control payload: {e}"));
            return;
        }
    };

    // Register the correlation before anything leaves the node, so a fast
    // reply cannot race the waiter.
    let key = pending_key(&request.organization_id, &agent.client_id, &message_id);
    let ticket = app.pending.prepare(key);

    let sent = send_control(&app, &agent, &request.organization_id, &inner, &message_id);
    if let Err(reason) = sent {
        respond_failure(delivery, &request, &reason);
        return;
    }

    match ticket.wait(app.config.control_response_timeout()).await {
        Some(response) => {
            delivery.respond(AgentControlCommandResponse {
                agent_id: request.agent_id.clone(),
                organization_id: request.organization_id.clone(),
                settings: response.output,
                success: response.success,
                message: response.message,
            });
        }
        None => {
            Stats::bump(&app.stats.bus_control_timeouts);
            respond_failure(
                delivery,
                &request,
                "Failed to send message to client: no response within the deadline",
            );
        }
    }
}

/// Puts the control envelope on the right wire: a gateway peer when the
/// agent lives behind one, the local stream otherwise.
fn send_control(
    app: &AppState,
    agent: &relay_protocol::ClientRegistration,
    organization_id: &str,
    inner: &str,
    message_id: &str,
) -> Result<(), String> {
    if let Some(gateway_id) = agent.gateway_id.as_deref() {
        if gateway_id != app.instance_id() {
            if let Some(peer) = app.directory.find_gateway_peer(gateway_id) {
                return proxy::forward(
                    app,
                    &peer,
                    MessageType::Control,
                    app.instance_id(),
                    &agent.client_id,
                    organization_id,
                    Some(inner.to_string()),
                    Some(message_id.to_string()),
                )
                .map_err(|e| format!("Failed to send message to client: {e}"));
            }
        }
    }

    if let Some(local) =
        app.directory
            .find_local_client(organization_id, &agent.client_id, SocketRole::Agent)
    {
        let mut envelope = Envelope::new(MessageType::Control)
            .from_id(app.instance_id())
            .to_id(agent.client_id.clone());
        envelope.message_id = Some(message_id.to_string());
        envelope.payload = Some(inner.to_string());
        return local
            .send(&envelope, Wrapping::Encrypt)
            .map_err(|e| format!("Failed to send message to client: {e}"));
    }

    Err("Client was not connected".to_string())
}

fn respond_failure(
    delivery: ControlDelivery,
    request: &crate::bus::AgentControlCommandRequest,
    message: &str,
) {
    delivery.respond(AgentControlCommandResponse {
        agent_id: request.agent_id.clone(),
        organization_id: request.organization_id.clone(),
        settings: None,
        success: false,
        message: Some(message.to_string()),
    });
}

// ─── Daily Purge ────────────────────────────────────────────────

/// Applies the retention window to the registry (and resets statistics)
/// when the daily tick arrives, after a random jitter so replicas spread
/// their writes.
pub async fn run_daily_purge(app: AppState) {
    let mut ticks = match app.bus.daily_messages().await {
        Ok(ticks) => ticks,
        Err(e) => {
            warn!("Daily purge subscription unavailable: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = app.shutdown.cancelled() => return,
            tick = ticks.recv() => {
                if tick.is_none() {
                    return;
                }
                let jitter = rand::thread_rng().gen_range(0..=PURGE_JITTER_SECS);
                tokio::time::sleep(std::time::Duration::from_secs(jitter)).await;

                let purged = app.registry.purge_stale(app.config.connection_retention()).await;
                info!(purged, "Daily registry purge done");
                if !app.config.disable_database_statistics {
                    app.stats.reset();
                }
            }
        }
    }
}

// ─── Public-Key Publication ─────────────────────────────────────

/// Publishes the node's public key on startup and then every two days.
/// Failures are logged and the schedule carries on.
pub async fn run_public_key_publisher(app: AppState) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(PUBLIC_KEY_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = app.shutdown.cancelled() => return,
            _ = interval.tick() => {
                let pem = match app.keys.public_key_pem() {
                    Ok(pem) => pem,
                    Err(e) => {
                        warn!("Public key export failed: {e}");
                        continue;
                    }
                };
                let message = crate::bus::PublicKeyMessage {
                    hash: app.keys.fingerprint().to_string(),
                    pem,
                    instance_name: app.instance_id().to_string(),
                    expires: app.config.key_expires_on,
                };
                if let Err(e) = app.bus.publish_public_key(message).await {
                    warn!("Public key publication failed: {e}");
                }
            }
        }
    }
}
