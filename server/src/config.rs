//! # Node Configuration
//!
//! Loads the node's TOML config file and validates the invariants that must
//! hold before anything binds: a gateway pre-shared key whenever gateway
//! features are in play, a non-empty protocol version set, sane size caps.
//!
//! Every duration is a plain integer number of seconds in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Deserialize;
use tracing::warn;

use crate::error::StartupError;

// ─── CLI ────────────────────────────────────────────────────────

/// Command-line surface: just the config file path, overridable from the
/// environment.
#[derive(Debug, Parser)]
#[command(name = "relay-server", about = "Relay node for the message fabric")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "RELAY_CONFIG", default_value = "relay.toml")]
    pub config: PathBuf,
}

// ─── Role ───────────────────────────────────────────────────────

/// Which behavior surface this node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Terminates Portal and Agent streams; dials outward to gateways.
    Service,
    /// Terminates Portal, Agent and inbound gateway streams.
    Gateway,
}

// ─── Config ─────────────────────────────────────────────────────

/// The node's configuration. Field names match the file keys one-to-one.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Selects the behavior table and ingress routes.
    pub role: Role,

    /// Unique across the fleet; stamped into registry rows as `gatewayId`.
    pub instance_id: String,

    /// Bind address for the HTTP/WebSocket listener.
    pub listen_addr: String,

    /// Where `GET /` redirects; 404 when unset.
    pub redirect_url: Option<String>,

    /// PEM private key for the node identity. An ephemeral key is generated
    /// when unset, which is fine for a single node and useless for a fleet.
    pub private_key_pem: Option<String>,

    /// Expiry advertised with the published public key.
    pub key_expires_on: Option<DateTime<Utc>>,

    /// Pre-shared key for the gateway handshake. Required whenever gateway
    /// features are configured.
    pub gateway_pre_shared_key: Option<String>,

    /// Comma-separated WebSocket URLs this node keeps outward connections
    /// to. Service role only.
    pub gateway_servers: String,

    /// Cap on total received bytes before a stream authenticates.
    pub max_bytes_before_authentication: u64,

    /// Cap on a single frame after authentication.
    pub max_message_size: u64,

    /// Receive buffer hint handed to the WebSocket listener.
    pub websocket_receive_buffer_size: usize,

    /// Seconds between liveness probes.
    pub ping_interval: u64,

    /// Seconds between outward gateway redial attempts.
    pub reconnect_interval: u64,

    /// Seconds a bus-originated control request waits for the agent.
    pub control_response_timeout: u64,

    /// Seconds after which a registry row no longer counts as live.
    pub client_inactivity_timeout: u64,

    /// Seconds a registry row is retained before the daily purge drops it.
    pub connection_retention: u64,

    /// Suppresses outbound ping emission when set.
    pub disable_ping_messages: bool,

    /// Skips writing client history rows to the durable store.
    pub disable_database_client_history: bool,

    /// Keeps the tenant registry purely in memory.
    pub in_memory_client_list: bool,

    /// Suppresses the statistics sink.
    pub disable_database_statistics: bool,

    /// Protocol versions an agent may assert. Anything else is denied.
    pub allowed_protocol_versions: Vec<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Service,
            instance_id: format!("relay-{}", uuid::Uuid::new_v4()),
            listen_addr: "0.0.0.0:7070".into(),
            redirect_url: None,
            private_key_pem: None,
            key_expires_on: None,
            gateway_pre_shared_key: None,
            gateway_servers: String::new(),
            max_bytes_before_authentication: 100_000,
            max_message_size: 1_048_576,
            websocket_receive_buffer_size: 65_536,
            ping_interval: 30,
            reconnect_interval: 30,
            control_response_timeout: 30,
            client_inactivity_timeout: 300,
            connection_retention: 86_400,
            disable_ping_messages: false,
            disable_database_client_history: false,
            in_memory_client_list: false,
            disable_database_statistics: false,
            allowed_protocol_versions: vec![1],
        }
    }
}

impl Config {
    /// Loads and validates the config file. A missing file yields the
    /// defaults (single-node development), any other read or parse failure
    /// is fatal.
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<Config>(&text)
                .map_err(|e| StartupError::InvalidConfig(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                Config::default()
            }
            Err(e) => return Err(StartupError::InvalidConfig(e.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), StartupError> {
        if self.instance_id.is_empty() {
            return Err(StartupError::MissingConfig("instance_id".into()));
        }
        if self.allowed_protocol_versions.is_empty() {
            return Err(StartupError::MissingConfig("allowed_protocol_versions".into()));
        }
        let uses_gateways = self.role == Role::Gateway || !self.gateway_server_list().is_empty();
        if uses_gateways && self.gateway_pre_shared_key.is_none() {
            return Err(StartupError::MissingConfig("gateway_pre_shared_key".into()));
        }
        if self.role == Role::Gateway && !self.gateway_server_list().is_empty() {
            return Err(StartupError::InvalidConfig(
                "gateway_servers is a service-role setting".into(),
            ));
        }
        if self.max_bytes_before_authentication == 0 || self.max_message_size == 0 {
            return Err(StartupError::InvalidConfig("size caps must be non-zero".into()));
        }
        Ok(())
    }

    /// Parses the comma-separated `gateway_servers` value.
    pub fn gateway_server_list(&self) -> Vec<String> {
        self.gateway_servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    pub fn control_response_timeout(&self) -> Duration {
        Duration::from_secs(self.control_response_timeout)
    }

    pub fn client_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.client_inactivity_timeout)
    }

    pub fn connection_retention(&self) -> Duration {
        Duration::from_secs(self.connection_retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn gateway_servers_require_a_pre_shared_key() {
        let config = Config {
            gateway_servers: "wss://g1.example".into(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StartupError::MissingConfig(_))
        ));
    }

    #[test]
    fn gateway_server_list_splits_and_trims() {
        let config = Config {
            gateway_servers: "wss://g1, wss://g2 ,".into(),
            gateway_pre_shared_key: Some("psk".into()),
            ..Config::default()
        };
        assert_eq!(config.gateway_server_list(), vec!["wss://g1", "wss://g2"]);
    }

    #[test]
    fn gateway_role_must_not_dial_out() {
        let config = Config {
            role: Role::Gateway,
            gateway_pre_shared_key: Some("psk".into()),
            gateway_servers: "wss://g1".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
