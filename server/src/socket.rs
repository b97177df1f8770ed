//! # Per-Stream Connection State
//!
//! One [`SocketState`] exists per accepted or dialed stream. It holds the
//! connection's place in the state machine, its authenticated identity, the
//! peer's public key once known, byte counters, and the outbound queue.
//!
//! Writes are serialized by construction: every send goes through one
//! unbounded queue drained by a single writer task, so two concurrent
//! senders can never interleave bytes on the wire.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use relay_protocol::{wrapping, Envelope, NodeKeyPair, PeerPublicKey, Wrapping};
use tokio::sync::mpsc;

use crate::error::BehaviorError;
use crate::interest::RecentInterestMap;

/// Close code for a graceful shutdown or explicit close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for any protocol violation.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

// ─── Connection State Machine ───────────────────────────────────

/// Where a stream is in its lifecycle. The state fixes which wrapping
/// inbound frames must carry and which message types the peer may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted but not yet route-tagged.
    Unknown,
    /// `/portal` ingress, awaiting `authportal`.
    PortalUnauth,
    /// Portal authenticated.
    PortalAuth,
    /// `/agent` ingress, awaiting `auth`.
    AgentUnauth,
    /// Agent authenticated; inbound frames are encrypted to this node.
    AgentAuth,
    /// Gateway peer, handshake in progress.
    GatewayUnauth,
    /// Gateway peer, handshake done.
    GatewayAuth,
}

impl ConnectionState {
    pub fn is_authenticated(self) -> bool {
        matches!(
            self,
            ConnectionState::PortalAuth | ConnectionState::AgentAuth | ConnectionState::GatewayAuth
        )
    }

    /// The wrapping every inbound frame must arrive in while the connection
    /// is in this state.
    pub fn expected_wrapping(self) -> Wrapping {
        match self {
            ConnectionState::AgentUnauth => Wrapping::SignOnly,
            ConnectionState::AgentAuth => Wrapping::Encrypt,
            _ => Wrapping::PlainText,
        }
    }

    /// The client kind this state implies.
    pub fn socket_role(self) -> SocketRole {
        match self {
            ConnectionState::PortalUnauth | ConnectionState::PortalAuth => SocketRole::Portal,
            ConnectionState::AgentUnauth | ConnectionState::AgentAuth => SocketRole::Agent,
            ConnectionState::GatewayUnauth | ConnectionState::GatewayAuth => SocketRole::Gateway,
            ConnectionState::Unknown => SocketRole::Unknown,
        }
    }
}

/// Kind of peer on the other end of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Agent,
    Portal,
    Gateway,
    Unknown,
}

// ─── Outbound Frames ────────────────────────────────────────────

/// What the writer task puts on the wire. Kept transport-agnostic so the
/// same state object works behind an axum ingress socket and a dialed
/// tungstenite socket.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// One envelope, already serialized and wrapped.
    Text(String),
    /// Close the stream with a code and reason, then stop writing.
    Close { code: u16, reason: String },
}

// ─── Identity ───────────────────────────────────────────────────

/// Identity fields set during authentication. The tenant never changes once
/// set; re-authentication refreshes everything else.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub client_id: Option<String>,
    pub organization_id: Option<String>,
    pub registered_agent_id: Option<String>,
    pub client_version: Option<String>,
    pub token_expiration: Option<DateTime<Utc>>,
    pub impersonated: bool,
}

// ─── Socket State ───────────────────────────────────────────────

/// All in-memory state for one stream.
pub struct SocketState {
    /// Node-local opaque id, assigned on accept.
    pub connection_id: String,

    pub connected_on: DateTime<Utc>,

    /// Remote address as reported by the listener, when known.
    pub client_ip: Option<String>,

    keys: Arc<NodeKeyPair>,
    state: RwLock<ConnectionState>,
    identity: RwLock<Identity>,
    peer_key: RwLock<Option<PeerPublicKey>>,

    /// Nonce this node issued in its `welcome`, kept to verify the gateway
    /// handshake hash.
    issued_nonce: RwLock<Option<String>>,

    outbound: mpsc::UnboundedSender<OutboundFrame>,

    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    last_received_ms: AtomicI64,
    last_sent_ms: AtomicI64,

    /// Tenant/client pairs recently proxied through this peer. Only used on
    /// gateway peer connections.
    pub interest: RecentInterestMap,
}

impl SocketState {
    pub fn new(
        connection_id: String,
        initial_state: ConnectionState,
        keys: Arc<NodeKeyPair>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        client_ip: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            connected_on: now,
            client_ip,
            keys,
            state: RwLock::new(initial_state),
            identity: RwLock::new(Identity::default()),
            peer_key: RwLock::new(None),
            issued_nonce: RwLock::new(None),
            outbound,
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            last_received_ms: AtomicI64::new(now.timestamp_millis()),
            last_sent_ms: AtomicI64::new(now.timestamp_millis()),
            interest: RecentInterestMap::new(),
        }
    }

    // ── State machine ──

    pub fn state(&self) -> ConnectionState {
        *self.state.read().expect("socket state lock")
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write().expect("socket state lock") = state;
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    // ── Identity ──

    pub fn identity(&self) -> Identity {
        self.identity.read().expect("socket identity lock").clone()
    }

    pub fn client_id(&self) -> Option<String> {
        self.identity.read().expect("socket identity lock").client_id.clone()
    }

    pub fn organization_id(&self) -> Option<String> {
        self.identity
            .read()
            .expect("socket identity lock")
            .organization_id
            .clone()
    }

    pub fn impersonated(&self) -> bool {
        self.identity.read().expect("socket identity lock").impersonated
    }

    /// Marks the connection as impersonated. The authenticator decides when;
    /// the command path denies such connections any destination.
    pub fn set_impersonated(&self, impersonated: bool) {
        self.identity.write().expect("socket identity lock").impersonated = impersonated;
    }

    /// Applies authentication results. The tenant is write-once: a re-auth
    /// that resolves to a different organization is a policy violation.
    pub fn apply_auth(
        &self,
        client_id: String,
        organization_id: String,
        token_expiration: Option<DateTime<Utc>>,
        client_version: Option<String>,
        registered_agent_id: Option<String>,
    ) -> Result<(), BehaviorError> {
        let mut identity = self.identity.write().expect("socket identity lock");
        if let Some(existing) = &identity.organization_id {
            if existing != &organization_id {
                return Err(BehaviorError::policy("Access denied"));
            }
        }
        identity.client_id = Some(client_id);
        identity.organization_id = Some(organization_id);
        identity.token_expiration = token_expiration;
        identity.client_version = client_version;
        identity.registered_agent_id = registered_agent_id;
        Ok(())
    }

    /// Sets the peer's client id without a full authentication, used by the
    /// gateway handshake where identity comes from the envelope.
    pub fn set_peer_identity(&self, client_id: String) {
        let mut identity = self.identity.write().expect("socket identity lock");
        identity.client_id = Some(client_id);
    }

    /// Whether the authenticated token has expired.
    pub fn token_expired(&self) -> bool {
        self.identity
            .read()
            .expect("socket identity lock")
            .token_expiration
            .map(|expires| expires < Utc::now())
            .unwrap_or(false)
    }

    // ── Peer key and nonces ──

    pub fn peer_key(&self) -> Option<PeerPublicKey> {
        self.peer_key.read().expect("socket key lock").clone()
    }

    pub fn set_peer_key(&self, key: PeerPublicKey) {
        *self.peer_key.write().expect("socket key lock") = Some(key);
    }

    pub fn issued_nonce(&self) -> Option<String> {
        self.issued_nonce.read().expect("socket nonce lock").clone()
    }

    pub fn set_issued_nonce(&self, nonce: String) {
        *self.issued_nonce.write().expect("socket nonce lock") = Some(nonce);
    }

    // ── Wire I/O ──

    /// Encodes the envelope in the given wrapping and queues it as one text
    /// frame. The queue plus its single drain task is the write serializer;
    /// frames leave the node in queue order, whole.
    pub fn send(&self, envelope: &Envelope, wrapping: Wrapping) -> Result<(), BehaviorError> {
        let recipient = self.peer_key();
        let text = wrapping::encode(envelope, wrapping, &self.keys, recipient.as_ref())?;
        let frame_len = text.len() as u64;
        self.outbound
            .send(OutboundFrame::Text(text))
            .map_err(|_| BehaviorError::Transient("connection closed".into()))?;
        self.bytes_sent.fetch_add(frame_len, Ordering::Relaxed);
        self.last_sent_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Queues a close frame. The writer task sends it and stops.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.outbound.send(OutboundFrame::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Records an inbound frame's size and arrival time.
    pub fn touch_received(&self, frame_len: u64) {
        self.bytes_received.fetch_add(frame_len, Ordering::Relaxed);
        self.last_received_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_received(&self) -> DateTime<Utc> {
        let ms = self.last_received_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    pub fn last_sent(&self) -> DateTime<Utc> {
        let ms = self.last_sent_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }
}

impl std::fmt::Debug for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketState")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .field("client_id", &self.client_id())
            .field("organization_id", &self.organization_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::MessageType;

    fn test_socket() -> (Arc<SocketState>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let keys = Arc::new(NodeKeyPair::generate().unwrap());
        let socket = Arc::new(SocketState::new(
            "c-1".into(),
            ConnectionState::PortalUnauth,
            keys,
            tx,
            None,
        ));
        (socket, rx)
    }

    #[test]
    fn wrapping_follows_the_state_table() {
        assert_eq!(
            ConnectionState::PortalUnauth.expected_wrapping(),
            Wrapping::PlainText
        );
        assert_eq!(
            ConnectionState::AgentUnauth.expected_wrapping(),
            Wrapping::SignOnly
        );
        assert_eq!(
            ConnectionState::AgentAuth.expected_wrapping(),
            Wrapping::Encrypt
        );
        assert_eq!(
            ConnectionState::GatewayAuth.expected_wrapping(),
            Wrapping::PlainText
        );
    }

    #[test]
    fn tenant_is_write_once() {
        let (socket, _rx) = test_socket();
        socket
            .apply_auth("P1".into(), "T1".into(), None, None, None)
            .unwrap();
        // Refreshing inside the same tenant is fine.
        socket
            .apply_auth("P1".into(), "T1".into(), None, Some("2".into()), None)
            .unwrap();
        // Moving tenants is not.
        assert!(socket
            .apply_auth("P1".into(), "T2".into(), None, None, None)
            .is_err());
    }

    #[tokio::test]
    async fn sends_are_queued_in_order() {
        let (socket, mut rx) = test_socket();
        for i in 0..3 {
            let env = Envelope::new(MessageType::Ping).from_id(format!("n{i}"));
            socket.send(&env, Wrapping::PlainText).unwrap();
        }
        for i in 0..3 {
            match rx.recv().await.unwrap() {
                OutboundFrame::Text(text) => {
                    let env: Envelope = serde_json::from_str(&text).unwrap();
                    assert_eq!(env.from.as_deref(), Some(format!("n{i}").as_str()));
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(socket.bytes_sent.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn token_expiry_is_detected() {
        let (socket, _rx) = test_socket();
        socket
            .apply_auth(
                "P1".into(),
                "T1".into(),
                Some(Utc::now() - chrono::Duration::minutes(1)),
                None,
                None,
            )
            .unwrap();
        assert!(socket.token_expired());
    }
}
