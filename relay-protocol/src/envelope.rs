//! # Message Envelopes
//!
//! Defines the envelope exchanged between Portals, Agents, Gateways and the
//! relay node, plus the typed payloads carried inside it. The envelope is a
//! flat camelCase JSON object sent as one WebSocket text frame; the `payload`
//! field is itself a serialized JSON string whose shape depends on `type`.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;

// ─── Message Types ──────────────────────────────────────────────

/// Every envelope type in the relay protocol.
///
/// Serialized lowercase, so `AuthPortal` appears as `"authportal"` on the
/// wire and `AuthGateway` as `"authgateway"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// First envelope on every new stream, sent by the node.
    Welcome,
    /// Portal authentication request and its result.
    AuthPortal,
    /// Agent authentication request and its result.
    Auth,
    /// Gateway handshake message and its result.
    AuthGateway,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Portal request for the tenant's live agents, and the pushed reply.
    List,
    /// Portal-to-agent request, and the agent's reply on the way back.
    Command,
    /// Backend-originated agent control request/response.
    Control,
    /// An envelope relayed between nodes on a gateway connection.
    Proxy,
    /// Non-fatal notice to the peer, carried in `errorMessage`.
    Warning,
}

impl MessageType {
    /// Wire name of the type, for log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Welcome => "welcome",
            MessageType::AuthPortal => "authportal",
            MessageType::Auth => "auth",
            MessageType::AuthGateway => "authgateway",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::List => "list",
            MessageType::Command => "command",
            MessageType::Control => "control",
            MessageType::Proxy => "proxy",
            MessageType::Warning => "warning",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Envelope ───────────────────────────────────────────────────

/// The on-wire message envelope.
///
/// All fields except `type` are optional; behaviors validate the fields they
/// need and treat a missing required field as a policy violation. `payload`
/// and `errorMessage` are mutually exclusive on replies: a success reply
/// carries a payload, a failure reply carries an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Sender identifier: an instance id, a client id, or "unknown".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Recipient identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// The envelope type; selects the behavior that handles it.
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Correlation token for request/reply flows. Required for every
    /// request/reply type; replies echo the request's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Serialized inner object; interpretation depends on `type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    /// Human-readable failure reason on error replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Envelope {
    /// Creates an envelope of the given type with a fresh `messageId`.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            from: None,
            to: None,
            message_type,
            message_id: Some(Uuid::new_v4().to_string()),
            payload: None,
            error_message: None,
        }
    }

    /// Creates a reply envelope: addressed back to the request's sender and
    /// carrying the request's `messageId` so the peer can correlate it.
    pub fn reply_to(request: &Envelope, message_type: MessageType) -> Self {
        Self {
            from: None,
            to: request.from.clone(),
            message_type,
            message_id: request.message_id.clone(),
            payload: None,
            error_message: None,
        }
    }

    /// Sets the sender identifier.
    pub fn from_id(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the recipient identifier.
    pub fn to_id(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Serializes `payload` into the envelope's payload string.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, CodecError> {
        let text = serde_json::to_string(payload)
            .map_err(|e| CodecError::MalformedPayload(e.to_string()))?;
        self.payload = Some(text);
        Ok(self)
    }

    /// Sets the failure reason and clears any payload.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self.payload = None;
        self
    }

    /// Parses the payload string into the expected type. A missing or
    /// malformed payload is an error the behavior surfaces as a policy
    /// violation.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let raw = self
            .payload
            .as_deref()
            .ok_or_else(|| CodecError::MalformedPayload("payload missing".into()))?;
        serde_json::from_str(raw).map_err(|e| CodecError::MalformedPayload(e.to_string()))
    }
}

// ─── Typed Payloads ─────────────────────────────────────────────

/// Payload of `authportal` and `auth` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMessage {
    /// Opaque bearer token, validated by the backend over the bus.
    pub token: String,

    /// Agent's public key, PEM. Present on `auth` only; this is the key the
    /// node encrypts to afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Client software version, recorded in the tenant registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,

    /// Protocol version the client speaks; must be in the allowed set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,

    /// Free-form client metadata, passed through to activity events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Payload of `authportal`/`auth`/`authgateway` result replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResultMessage {
    pub accepted: bool,
    pub will_replace_token: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_token: Option<String>,
}

/// Payload of the `welcome` envelope sent on every accepted stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeMessage {
    /// base64(SHA-256) of the node's public key, so clients can pin it.
    pub public_key_hash: String,

    /// The node's instance name.
    pub machine_name: String,

    /// The node's software version.
    pub server_version: String,

    /// Fresh random nonce, present on gateway ingress only. The dialing peer
    /// includes it in the handshake hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Protocol versions this node accepts.
    pub allowed_protocol_versions: Vec<u32>,
}

/// Payload of the `authgateway` handshake message from the dialing peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthGatewayMessage {
    /// The dialer's own fresh nonce.
    pub nonce: String,

    /// HMAC over both nonces keyed by the pre-shared key.
    pub hash: String,
}

/// Inner envelope carried between nodes inside an outer `proxy` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMessage {
    /// Type of the relayed envelope: `command`, `control` or `list`.
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Original sender's client id (or instance id for bus-originated
    /// control requests).
    pub from: String,

    /// Target client id on the receiving node.
    pub to: String,

    /// Tenant the relay is scoped to. A mismatch with the target's tenant
    /// drops the message on the receiving node.
    pub organization_id: String,

    /// Payload of the original request, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_message: Option<String>,
}

/// Payload of a backend-originated `control` request to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub command: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Payload of an agent's `control` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Client kind recorded in the tenant registry and on `list` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    Agent,
    Portal,
}

/// One row of the tenant registry, serialized in `list` replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,
    pub organization_id: String,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_registration_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    /// Instance id of the node terminating this client's stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    pub last_updated_on: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_types_use_wire_names() {
        let json = serde_json::to_string(&MessageType::AuthPortal).unwrap();
        assert_eq!(json, "\"authportal\"");
        let json = serde_json::to_string(&MessageType::AuthGateway).unwrap();
        assert_eq!(json, "\"authgateway\"");
        let back: MessageType = serde_json::from_str("\"welcome\"").unwrap();
        assert_eq!(back, MessageType::Welcome);
    }

    #[test]
    fn envelope_wire_shape_is_flat_camel_case() {
        let env = Envelope::new(MessageType::Command)
            .from_id("P1")
            .to_id("A1")
            .with_payload(&serde_json::json!({"run": "status"}))
            .unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["from"], "P1");
        assert_eq!(json["to"], "A1");
        assert!(json["messageId"].is_string());
        assert!(json["payload"].is_string());
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn reply_addresses_the_request_sender_and_keeps_the_id() {
        let req = Envelope::new(MessageType::List).from_id("P1");
        let reply = Envelope::reply_to(&req, MessageType::List);
        assert_eq!(reply.to.as_deref(), Some("P1"));
        assert_eq!(reply.message_id, req.message_id);
    }

    #[test]
    fn payload_round_trips_through_the_string_field() {
        let auth = AuthMessage {
            token: "t".into(),
            public_key: None,
            client_version: Some("1".into()),
            protocol_version: Some(1),
            metadata: None,
        };
        let env = Envelope::new(MessageType::AuthPortal)
            .with_payload(&auth)
            .unwrap();
        let back: AuthMessage = env.payload_as().unwrap();
        assert_eq!(back.token, "t");
        assert_eq!(back.protocol_version, Some(1));
    }

    #[test]
    fn missing_payload_is_an_error() {
        let env = Envelope::new(MessageType::Auth);
        assert!(env.payload_as::<AuthMessage>().is_err());
    }

    #[test]
    fn client_type_uses_pascal_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&ClientType::Agent).unwrap(),
            "\"Agent\""
        );
    }
}
