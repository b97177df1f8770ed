//! # Message-Bus Port
//!
//! The node talks to the rest of the platform over a request/reply and
//! publish/subscribe bus: token validation, agent activity events, the
//! periodic public-key announcement, backend-originated control requests and
//! the daily purge trigger.
//!
//! The transport itself is an external collaborator. [`MessageBus`] is the
//! narrow port the node programs against; [`InProcessBus`] is the in-process
//! implementation wired by default and used by the tests.

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Bus-level failures surfaced to callers.
#[derive(Debug, Error)]
pub enum BusError {
    /// The request/reply deadline elapsed.
    #[error("bus timeout")]
    Timeout,

    /// The transport is not available or the subscription was already taken.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

// ─── Conversations ──────────────────────────────────────────────

/// Reply shape of both token-validation conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TokenValidationResponse {
    /// A rejection with a reason, used when validation cannot even run.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            organization_id: None,
            registered_agent_id: None,
            expires: None,
            new_token: None,
            message: Some(message.into()),
        }
    }
}

/// Backend request to run a command on an agent somewhere in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentControlCommandRequest {
    pub agent_id: String,
    pub organization_id: String,
    pub command: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Reply to a control request. Always sent, even when the attempt failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentControlCommandResponse {
    pub agent_id: String,
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lifecycle signal published when an agent connects, pings or disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentActivityType {
    Connected,
    Ping,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivityMessage {
    pub activity_type: AgentActivityType,
    pub connected_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Periodic announcement of this node's public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyMessage {
    pub hash: String,
    pub pem: String,
    pub instance_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

/// Daily tick that triggers registry and statistics purges.
#[derive(Debug, Clone, Copy)]
pub struct DailyMessage;

/// One control request plus the responder the intake must always answer.
/// The transport applies the one-minute reply TTL.
#[derive(Debug)]
pub struct ControlDelivery {
    pub request: AgentControlCommandRequest,
    responder: oneshot::Sender<AgentControlCommandResponse>,
}

impl ControlDelivery {
    pub fn respond(self, response: AgentControlCommandResponse) {
        // The requester may have given up; a dropped responder is fine.
        let _ = self.responder.send(response);
    }
}

// ─── Port ───────────────────────────────────────────────────────

/// Everything the node asks of the bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// `ValidateAgentRequestToken` request/reply.
    async fn validate_agent_token(&self, token: &str) -> Result<TokenValidationResponse, BusError>;

    /// `ValidateConnectRequestToken` request/reply.
    async fn validate_connect_token(&self, token: &str)
        -> Result<TokenValidationResponse, BusError>;

    /// Publishes an agent activity event. Best-effort.
    async fn publish_agent_activity(&self, message: AgentActivityMessage) -> Result<(), BusError>;

    /// Publishes the node's public key. Best-effort.
    async fn publish_public_key(&self, message: PublicKeyMessage) -> Result<(), BusError>;

    /// Takes the stream of inbound control requests. Single consumer.
    async fn control_requests(&self) -> Result<mpsc::Receiver<ControlDelivery>, BusError>;

    /// Takes the stream of daily purge ticks. Single consumer.
    async fn daily_messages(&self) -> Result<mpsc::Receiver<DailyMessage>, BusError>;
}

// ─── In-Process Implementation ──────────────────────────────────

type Validator = Arc<dyn Fn(&str) -> TokenValidationResponse + Send + Sync>;

/// Channel-backed bus living inside the process. Token validators are
/// pluggable closures; published events go to whoever took the matching
/// receiver, or nowhere (publishing stays best-effort).
pub struct InProcessBus {
    agent_validator: RwLock<Validator>,
    connect_validator: RwLock<Validator>,
    control_tx: mpsc::Sender<ControlDelivery>,
    control_rx: Mutex<Option<mpsc::Receiver<ControlDelivery>>>,
    daily_tx: mpsc::Sender<DailyMessage>,
    daily_rx: Mutex<Option<mpsc::Receiver<DailyMessage>>>,
    activity_tx: mpsc::UnboundedSender<AgentActivityMessage>,
    activity_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentActivityMessage>>>,
    key_tx: mpsc::UnboundedSender<PublicKeyMessage>,
    key_rx: Mutex<Option<mpsc::UnboundedReceiver<PublicKeyMessage>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        let reject: Validator =
            Arc::new(|_| TokenValidationResponse::rejected("no validator attached"));
        let (control_tx, control_rx) = mpsc::channel(64);
        let (daily_tx, daily_rx) = mpsc::channel(4);
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        let (key_tx, key_rx) = mpsc::unbounded_channel();
        Self {
            agent_validator: RwLock::new(Arc::clone(&reject)),
            connect_validator: RwLock::new(reject),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            daily_tx,
            daily_rx: Mutex::new(Some(daily_rx)),
            activity_tx,
            activity_rx: Mutex::new(Some(activity_rx)),
            key_tx,
            key_rx: Mutex::new(Some(key_rx)),
        }
    }

    /// Installs the agent-token validator.
    pub fn set_agent_validator<F>(&self, validator: F)
    where
        F: Fn(&str) -> TokenValidationResponse + Send + Sync + 'static,
    {
        *self.agent_validator.write().expect("bus validator lock") = Arc::new(validator);
    }

    /// Installs the connect-token (portal) validator.
    pub fn set_connect_validator<F>(&self, validator: F)
    where
        F: Fn(&str) -> TokenValidationResponse + Send + Sync + 'static,
    {
        *self.connect_validator.write().expect("bus validator lock") = Arc::new(validator);
    }

    /// Injects a control request, returning the future reply. What the bus
    /// transport does on the wire, reproduced in-process.
    pub async fn inject_control(
        &self,
        request: AgentControlCommandRequest,
    ) -> Result<oneshot::Receiver<AgentControlCommandResponse>, BusError> {
        let (responder, reply) = oneshot::channel();
        self.control_tx
            .send(ControlDelivery { request, responder })
            .await
            .map_err(|_| BusError::Unavailable("control intake stopped".into()))?;
        Ok(reply)
    }

    /// Injects a daily purge tick.
    pub async fn inject_daily(&self) -> Result<(), BusError> {
        self.daily_tx
            .send(DailyMessage)
            .await
            .map_err(|_| BusError::Unavailable("daily intake stopped".into()))
    }

    /// Takes the stream of published activity events (observer side).
    pub fn take_activity_events(&self) -> Option<mpsc::UnboundedReceiver<AgentActivityMessage>> {
        self.activity_rx.lock().expect("bus receiver lock").take()
    }

    /// Takes the stream of published public keys (observer side).
    pub fn take_public_keys(&self) -> Option<mpsc::UnboundedReceiver<PublicKeyMessage>> {
        self.key_rx.lock().expect("bus receiver lock").take()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn validate_agent_token(&self, token: &str) -> Result<TokenValidationResponse, BusError> {
        let validator = Arc::clone(&self.agent_validator.read().expect("bus validator lock"));
        Ok(validator.as_ref()(token))
    }

    async fn validate_connect_token(
        &self,
        token: &str,
    ) -> Result<TokenValidationResponse, BusError> {
        let validator = Arc::clone(&self.connect_validator.read().expect("bus validator lock"));
        Ok(validator.as_ref()(token))
    }

    async fn publish_agent_activity(&self, message: AgentActivityMessage) -> Result<(), BusError> {
        // No observer attached means the event goes nowhere, which is fine
        // for a best-effort publication.
        let _ = self.activity_tx.send(message);
        Ok(())
    }

    async fn publish_public_key(&self, message: PublicKeyMessage) -> Result<(), BusError> {
        let _ = self.key_tx.send(message);
        Ok(())
    }

    async fn control_requests(&self) -> Result<mpsc::Receiver<ControlDelivery>, BusError> {
        self.control_rx
            .lock()
            .expect("bus receiver lock")
            .take()
            .ok_or_else(|| BusError::Unavailable("control subscription already taken".into()))
    }

    async fn daily_messages(&self) -> Result<mpsc::Receiver<DailyMessage>, BusError> {
        self.daily_rx
            .lock()
            .expect("bus receiver lock")
            .take()
            .ok_or_else(|| BusError::Unavailable("daily subscription already taken".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validators_are_pluggable() {
        let bus = InProcessBus::new();
        let rejected = bus.validate_connect_token("t").await.unwrap();
        assert!(!rejected.success);

        bus.set_connect_validator(|token| TokenValidationResponse {
            success: token == "good",
            organization_id: Some("T1".into()),
            registered_agent_id: None,
            expires: None,
            new_token: None,
            message: None,
        });
        assert!(bus.validate_connect_token("good").await.unwrap().success);
        assert!(!bus.validate_connect_token("bad").await.unwrap().success);
    }

    #[tokio::test]
    async fn control_requests_flow_through_with_a_responder() {
        let bus = InProcessBus::new();
        let mut rx = bus.control_requests().await.unwrap();
        let reply = bus
            .inject_control(AgentControlCommandRequest {
                agent_id: "r-1".into(),
                organization_id: "T1".into(),
                command: "status".into(),
                settings: serde_json::json!({}),
            })
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.request.agent_id, "r-1");
        delivery.respond(AgentControlCommandResponse {
            agent_id: "r-1".into(),
            organization_id: "T1".into(),
            settings: None,
            success: true,
            message: None,
        });
        assert!(reply.await.unwrap().success);
    }

    #[tokio::test]
    async fn subscriptions_are_single_consumer() {
        let bus = InProcessBus::new();
        assert!(bus.control_requests().await.is_ok());
        assert!(bus.control_requests().await.is_err());
    }
}
