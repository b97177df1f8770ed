//! # Behavior Dispatch
//!
//! Maps an inbound envelope's `type` to the behavior that handles it. The
//! table is fixed; state preconditions live inside each behavior, not here.
//! A behavior returning a policy error closes the stream; anything else is
//! logged by the receive loop and the stream lives on.

pub mod auth_agent;
pub mod auth_gateway;
pub mod auth_portal;
pub mod command;
pub mod control;
pub mod lifecycle;
pub mod list;
pub mod ping;
pub mod proxy;
pub mod welcome;

use std::sync::Arc;

use relay_protocol::{Envelope, MessageType, Wrapping};
use tracing::{info, warn};

use crate::error::BehaviorError;
use crate::socket::{SocketRole, SocketState, CLOSE_POLICY_VIOLATION};
use crate::state::AppState;
use crate::stats::Stats;

/// Runs the behavior for one inbound envelope. `raw` is the wire text the
/// envelope was decoded from; the agent auth behavior needs it to check the
/// signature against the key carried in the payload.
pub async fn dispatch(
    app: &AppState,
    socket: &Arc<SocketState>,
    envelope: Envelope,
    raw: &str,
) -> Result<(), BehaviorError> {
    match envelope.message_type {
        MessageType::Welcome => welcome::run(app, socket, envelope).await,
        MessageType::AuthPortal => auth_portal::run(app, socket, envelope).await,
        MessageType::Auth => auth_agent::run(app, socket, envelope, raw).await,
        MessageType::AuthGateway => auth_gateway::run(app, socket, envelope).await,
        MessageType::Ping => ping::run_ping(app, socket, envelope).await,
        MessageType::Pong => ping::run_pong(app, socket, envelope).await,
        MessageType::List => list::run(app, socket, envelope).await,
        MessageType::Command => command::run(app, socket, envelope).await,
        MessageType::Control => control::run(app, socket, envelope).await,
        MessageType::Proxy => proxy::run(app, socket, envelope).await,
        MessageType::Warning => {
            info!(
                connection = %socket.connection_id,
                "Peer warning: {}",
                envelope.error_message.as_deref().unwrap_or("(no reason)")
            );
            Ok(())
        }
    }
}

/// Wrapping used when this node sends to a peer of the given role: agents
/// get envelopes encrypted to their key, everyone else gets plaintext.
pub(crate) fn send_wrapping(role: SocketRole) -> Wrapping {
    match role {
        SocketRole::Agent => Wrapping::Encrypt,
        _ => Wrapping::PlainText,
    }
}

/// Cross-tenant denial: closes the supposed destination stream (when it is
/// attached here) and returns the policy error that closes the source. The
/// receive loop counts the violation when it acts on the error.
pub(crate) fn deny_access(app: &AppState, destination: Option<&SocketState>) -> BehaviorError {
    if let Some(destination) = destination {
        warn!(
            connection = %destination.connection_id,
            "Closing destination of a cross-tenant attempt"
        );
        destination.close(CLOSE_POLICY_VIOLATION, "Access denied");
        Stats::bump(&app.stats.policy_violations);
    }
    BehaviorError::policy("Access denied")
}
