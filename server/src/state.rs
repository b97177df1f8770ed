//! # Shared Node State
//!
//! The collaborators every handler needs, built once at startup and cloned
//! into each task. Nothing here reaches back into behaviors; the dependency
//! graph points one way.

use std::sync::Arc;

use relay_protocol::NodeKeyPair;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::config::Config;
use crate::directory::ConnectionDirectory;
use crate::pending::PendingResponses;
use crate::registry::ClientRegistry;
use crate::stats::Stats;

/// Shared application state, cloned and passed to each task and handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub keys: Arc<NodeKeyPair>,
    pub directory: Arc<ConnectionDirectory>,
    pub registry: Arc<dyn ClientRegistry>,
    pub pending: PendingResponses,
    pub bus: Arc<dyn MessageBus>,
    pub stats: Arc<Stats>,

    /// Node-wide shutdown signal; every loop and worker watches it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        keys: Arc<NodeKeyPair>,
        registry: Arc<dyn ClientRegistry>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            config,
            keys,
            directory: Arc::new(ConnectionDirectory::new()),
            registry,
            pending: PendingResponses::new(),
            bus,
            stats: Arc::new(Stats::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// This node's instance id, stamped into registry rows and proxy
    /// envelopes.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }
}
