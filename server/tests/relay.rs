//! End-to-end behavior tests: streams are simulated by feeding frames into
//! the receive-loop entry points and observing each connection's outbound
//! queue, with the in-process bus standing in for the platform.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_protocol::{
    wrapping, AuthMessage, AuthResultMessage, ClientRegistration, ClientType, ControlResponse,
    Envelope, MessageType, NodeKeyPair, ProxyMessage, Wrapping,
};
use tokio::sync::mpsc;

use relay_server::behaviors;
use relay_server::bus::{AgentControlCommandRequest, InProcessBus, TokenValidationResponse};
use relay_server::config::{Config, Role};
use relay_server::handlers::process_frame;
use relay_server::intake;
use relay_server::registry::{InMemoryRegistry, NewRegistration};
use relay_server::socket::{ConnectionState, OutboundFrame, SocketState, CLOSE_POLICY_VIOLATION};
use relay_server::state::AppState;

// ─── Harness ────────────────────────────────────────────────────

struct TestNode {
    app: AppState,
    bus: Arc<InProcessBus>,
}

fn node(instance_id: &str, role: Role) -> TestNode {
    let config = Config {
        role,
        instance_id: instance_id.into(),
        gateway_pre_shared_key: Some("psk".into()),
        control_response_timeout: 1,
        ..Config::default()
    };
    let bus = Arc::new(InProcessBus::new());
    let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(300)));
    let app = AppState::new(
        Arc::new(config),
        Arc::new(NodeKeyPair::generate().unwrap()),
        registry,
        Arc::clone(&bus) as Arc<dyn relay_server::bus::MessageBus>,
    );
    TestNode { app, bus }
}

struct TestConn {
    socket: Arc<SocketState>,
    rx: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl TestConn {
    /// Next queued frame, which must be an envelope in the given wrapping.
    async fn next_envelope(&mut self, wrapping: Wrapping, keys: &NodeKeyPair) -> Envelope {
        match self.rx.recv().await.expect("frame expected") {
            OutboundFrame::Text(text) => {
                wrapping::decode(&text, wrapping, keys, None).expect("decodable envelope")
            }
            OutboundFrame::Close { code, reason } => {
                panic!("expected an envelope, got close {code}: {reason}")
            }
        }
    }

    /// Next queued frame, which must be a close frame.
    async fn next_close(&mut self) -> (u16, String) {
        loop {
            match self.rx.recv().await.expect("frame expected") {
                OutboundFrame::Close { code, reason } => return (code, reason),
                OutboundFrame::Text(_) => continue,
            }
        }
    }
}

fn connect(node: &TestNode, id: &str, state: ConnectionState) -> TestConn {
    let (tx, rx) = mpsc::unbounded_channel();
    let socket = Arc::new(SocketState::new(
        id.into(),
        state,
        Arc::clone(&node.app.keys),
        tx,
        None,
    ));
    if state.socket_role() == relay_server::socket::SocketRole::Gateway {
        node.app.directory.add_gateway(Arc::clone(&socket));
    } else {
        node.app.directory.add_client(Arc::clone(&socket));
    }
    TestConn { socket, rx }
}

fn accept_all_portals(bus: &InProcessBus, organization_id: &'static str) {
    bus.set_connect_validator(move |_| TokenValidationResponse {
        success: true,
        organization_id: Some(organization_id.into()),
        registered_agent_id: None,
        expires: Some(Utc::now() + chrono::Duration::hours(1)),
        new_token: None,
        message: None,
    });
}

async fn authenticate_portal(node: &TestNode, conn: &mut TestConn, client_id: &str) {
    let request = Envelope::new(MessageType::AuthPortal)
        .from_id(client_id)
        .with_payload(&AuthMessage {
            token: "t".into(),
            public_key: None,
            client_version: Some("1".into()),
            protocol_version: Some(1),
            metadata: None,
        })
        .unwrap();
    behaviors::dispatch(&node.app, &conn.socket, request, "").await.unwrap();
    let reply = conn.next_envelope(Wrapping::PlainText, &node.app.keys).await;
    let result: AuthResultMessage = reply.payload_as().unwrap();
    assert!(result.accepted);
    assert_eq!(conn.socket.state(), ConnectionState::PortalAuth);
}

/// Wires up an authenticated local agent: directory entry, registry row and
/// the agent's own key pair for decrypting what the node sends it.
async fn attach_agent(
    node: &TestNode,
    connection_id: &str,
    client_id: &str,
    organization_id: &str,
    machine_registration_id: Option<&str>,
) -> (TestConn, NodeKeyPair) {
    let agent_keys = NodeKeyPair::generate().unwrap();
    let conn = connect(node, connection_id, ConnectionState::AgentAuth);
    conn.socket
        .apply_auth(client_id.into(), organization_id.into(), None, None, None)
        .unwrap();
    conn.socket.set_peer_key(
        relay_protocol::PeerPublicKey::from_pem(&agent_keys.public_key_pem().unwrap()).unwrap(),
    );
    node.app
        .registry
        .register(NewRegistration {
            client_type: ClientType::Agent,
            connection_id: connection_id.into(),
            client_id: client_id.into(),
            organization_id: organization_id.into(),
            registered_agent_id: machine_registration_id.map(String::from),
            client_version: None,
            gateway_id: Some(node.app.config.instance_id.clone()),
            client_ip: None,
        })
        .await;
    (conn, agent_keys)
}

async fn register_remote_agent(
    node: &TestNode,
    client_id: &str,
    organization_id: &str,
    gateway_id: &str,
) {
    node.app
        .registry
        .register(NewRegistration {
            client_type: ClientType::Agent,
            connection_id: format!("remote-{client_id}"),
            client_id: client_id.into(),
            organization_id: organization_id.into(),
            registered_agent_id: None,
            client_version: None,
            gateway_id: Some(gateway_id.into()),
            client_ip: None,
        })
        .await;
}

// ─── Scenario: happy-path list ──────────────────────────────────

#[tokio::test]
async fn portal_authenticates_and_lists_the_tenants_agents() {
    let node = node("S1", Role::Service);
    accept_all_portals(&node.bus, "T1");

    let mut portal = connect(&node, "c-p1", ConnectionState::PortalUnauth);
    authenticate_portal(&node, &mut portal, "P1").await;

    let (_a1, _) = attach_agent(&node, "c-a1", "A1", "T1", None).await;
    let (_a2, _) = attach_agent(&node, "c-a2", "A2", "T1", None).await;

    let mut request = Envelope::new(MessageType::List).from_id("P1");
    request.message_id = Some("m1".into());
    behaviors::dispatch(&node.app, &portal.socket, request, "").await.unwrap();

    let reply = portal.next_envelope(Wrapping::PlainText, &node.app.keys).await;
    assert_eq!(reply.message_type, MessageType::List);
    assert_eq!(reply.to.as_deref(), Some("P1"));
    assert_eq!(reply.message_id.as_deref(), Some("m1"));
    let agents: Vec<ClientRegistration> = reply.payload_as().unwrap();
    let mut ids: Vec<_> = agents.iter().map(|a| a.client_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["A1", "A2"]);
}

#[tokio::test]
async fn failed_portal_auth_leaves_the_stream_open_for_retry() {
    let node = node("S1", Role::Service);
    node.bus.set_connect_validator(|token| {
        if token == "good" {
            TokenValidationResponse {
                success: true,
                organization_id: Some("T1".into()),
                registered_agent_id: None,
                expires: None,
                new_token: None,
                message: None,
            }
        } else {
            TokenValidationResponse::rejected("bad token")
        }
    });

    let mut portal = connect(&node, "c-p1", ConnectionState::PortalUnauth);
    let bad = Envelope::new(MessageType::AuthPortal)
        .from_id("P1")
        .with_payload(&AuthMessage {
            token: "wrong".into(),
            public_key: None,
            client_version: None,
            protocol_version: Some(1),
            metadata: None,
        })
        .unwrap();
    behaviors::dispatch(&node.app, &portal.socket, bad, "").await.unwrap();
    let reply = portal.next_envelope(Wrapping::PlainText, &node.app.keys).await;
    let result: AuthResultMessage = reply.payload_as().unwrap();
    assert!(!result.accepted);
    assert_eq!(portal.socket.state(), ConnectionState::PortalUnauth);

    // Same stream, new token: the retry succeeds.
    let good = Envelope::new(MessageType::AuthPortal)
        .from_id("P1")
        .with_payload(&AuthMessage {
            token: "good".into(),
            public_key: None,
            client_version: None,
            protocol_version: Some(1),
            metadata: None,
        })
        .unwrap();
    behaviors::dispatch(&node.app, &portal.socket, good, "").await.unwrap();
    let reply = portal.next_envelope(Wrapping::PlainText, &node.app.keys).await;
    let result: AuthResultMessage = reply.payload_as().unwrap();
    assert!(result.accepted);
    assert_eq!(portal.socket.state(), ConnectionState::PortalAuth);
}

#[tokio::test]
async fn agent_authenticates_over_sign_only() {
    let node = node("S1", Role::Service);
    node.bus.set_agent_validator(|_| TokenValidationResponse {
        success: true,
        organization_id: Some("T1".into()),
        registered_agent_id: Some("r-1".into()),
        expires: None,
        new_token: None,
        message: None,
    });

    let agent_keys = NodeKeyPair::generate().unwrap();
    let mut agent = connect(&node, "c-a1", ConnectionState::AgentUnauth);
    let auth = Envelope::new(MessageType::Auth)
        .from_id("A1")
        .with_payload(&AuthMessage {
            token: "t".into(),
            public_key: Some(agent_keys.public_key_pem().unwrap()),
            client_version: Some("1".into()),
            protocol_version: Some(1),
            metadata: None,
        })
        .unwrap();
    let wire = wrapping::encode(&auth, Wrapping::SignOnly, &agent_keys, None).unwrap();
    assert!(process_frame(&node.app, &agent.socket, &wire).await);

    let reply = agent.next_envelope(Wrapping::SignOnly, &node.app.keys).await;
    assert_eq!(reply.message_type, MessageType::Auth);
    let result: AuthResultMessage = reply.payload_as().unwrap();
    assert!(result.accepted);
    assert_eq!(agent.socket.state(), ConnectionState::AgentAuth);
    assert_eq!(agent.socket.organization_id().as_deref(), Some("T1"));

    let rows = node.app.registry.get_agents("T1").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].gateway_id.as_deref(), Some("S1"));
    assert_eq!(rows[0].machine_registration_id.as_deref(), Some("r-1"));
}

#[tokio::test]
async fn agent_with_a_disallowed_protocol_version_is_rejected() {
    let node = node("S1", Role::Service);
    let agent_keys = NodeKeyPair::generate().unwrap();
    let mut agent = connect(&node, "c-a1", ConnectionState::AgentUnauth);
    let auth = Envelope::new(MessageType::Auth)
        .from_id("A1")
        .with_payload(&AuthMessage {
            token: "t".into(),
            public_key: Some(agent_keys.public_key_pem().unwrap()),
            client_version: None,
            protocol_version: Some(99),
            metadata: None,
        })
        .unwrap();
    let wire = wrapping::encode(&auth, Wrapping::SignOnly, &agent_keys, None).unwrap();
    assert!(!process_frame(&node.app, &agent.socket, &wire).await);

    let (code, reason) = agent.next_close().await;
    assert_eq!(code, CLOSE_POLICY_VIOLATION);
    assert_eq!(reason, "Invalid protocol version");
}

#[tokio::test]
async fn repeated_authportal_on_an_authenticated_stream_keeps_the_state() {
    let node = node("S1", Role::Service);
    accept_all_portals(&node.bus, "T1");
    let mut portal = connect(&node, "c-p1", ConnectionState::PortalUnauth);
    authenticate_portal(&node, &mut portal, "P1").await;
    // Re-auth refreshes the session without degrading anything.
    authenticate_portal(&node, &mut portal, "P1").await;
    assert_eq!(portal.socket.organization_id().as_deref(), Some("T1"));
}

// ─── Scenario: cross-tenant denial ──────────────────────────────

#[tokio::test]
async fn cross_tenant_command_closes_both_streams() {
    let node = node("S1", Role::Service);
    accept_all_portals(&node.bus, "T1");

    let mut portal = connect(&node, "c-p1", ConnectionState::PortalUnauth);
    authenticate_portal(&node, &mut portal, "P1").await;
    let (mut other_agent, _) = attach_agent(&node, "c-a2", "A2", "T2", None).await;

    let mut command = Envelope::new(MessageType::Command).from_id("P1").to_id("A2");
    command.message_id = Some("m2".into());
    let err = behaviors::dispatch(&node.app, &portal.socket, command, "")
        .await
        .unwrap_err();
    assert!(err.closes_stream());
    assert_eq!(err.close_reason(), "Access denied");

    // The supposed destination is closed as well.
    let (code, reason) = other_agent.next_close().await;
    assert_eq!(code, CLOSE_POLICY_VIOLATION);
    assert_eq!(reason, "Access denied");
}

// ─── Scenario: gateway proxy forward ────────────────────────────

#[tokio::test]
async fn command_for_a_remote_agent_is_proxied_through_the_gateway_peer() {
    let node = node("S1", Role::Service);
    accept_all_portals(&node.bus, "T1");

    let mut portal = connect(&node, "c-p1", ConnectionState::PortalUnauth);
    authenticate_portal(&node, &mut portal, "P1").await;

    let mut peer = connect(&node, "c-g1", ConnectionState::GatewayUnauth);
    peer.socket.set_peer_identity("G".into());
    peer.socket.set_state(ConnectionState::GatewayAuth);
    register_remote_agent(&node, "A3", "T1", "G").await;

    let mut command = Envelope::new(MessageType::Command).from_id("P1").to_id("A3");
    command.message_id = Some("m3".into());
    command.payload = Some("{\"run\":\"status\"}".into());
    behaviors::dispatch(&node.app, &portal.socket, command, "").await.unwrap();

    let outer = peer.next_envelope(Wrapping::PlainText, &node.app.keys).await;
    assert_eq!(outer.message_type, MessageType::Proxy);
    assert_eq!(outer.message_id.as_deref(), Some("m3"));
    let proxy: ProxyMessage = outer.payload_as().unwrap();
    assert_eq!(proxy.message_type, MessageType::Command);
    assert_eq!(proxy.from, "P1");
    assert_eq!(proxy.to, "A3");
    assert_eq!(proxy.organization_id, "T1");
    assert_eq!(proxy.inner_message.as_deref(), Some("{\"run\":\"status\"}"));

    // The relay direction is remembered for the reply path.
    assert!(peer.socket.interest.contains("T1", "A3"));
}

#[tokio::test]
async fn proxied_command_is_delivered_encrypted_to_the_local_agent() {
    let node = node("G", Role::Gateway);
    let (mut agent, agent_keys) = attach_agent(&node, "c-a3", "A3", "T1", None).await;

    let ingress = connect(&node, "c-s1", ConnectionState::GatewayUnauth);
    ingress.socket.set_peer_identity("S1".into());
    ingress.socket.set_state(ConnectionState::GatewayAuth);

    let mut outer = Envelope::new(MessageType::Proxy).from_id("S1");
    outer.message_id = Some("m3".into());
    let outer = outer
        .with_payload(&ProxyMessage {
            message_type: MessageType::Command,
            from: "P1".into(),
            to: "A3".into(),
            organization_id: "T1".into(),
            inner_message: Some("{\"run\":\"status\"}".into()),
        })
        .unwrap();
    behaviors::dispatch(&node.app, &ingress.socket, outer, "").await.unwrap();

    let delivered = agent.next_envelope(Wrapping::Encrypt, &agent_keys).await;
    assert_eq!(delivered.message_type, MessageType::Command);
    assert_eq!(delivered.from.as_deref(), Some("P1"));
    assert_eq!(delivered.message_id.as_deref(), Some("m3"));
    assert_eq!(delivered.payload.as_deref(), Some("{\"run\":\"status\"}"));

    // The originator is remembered so the reply can route back.
    assert!(ingress.socket.interest.contains("T1", "P1"));
}

#[tokio::test]
async fn proxied_command_with_a_tenant_mismatch_is_dropped() {
    let node = node("G", Role::Gateway);
    let (mut agent, _) = attach_agent(&node, "c-a3", "A3", "T2", None).await;

    let ingress = connect(&node, "c-s1", ConnectionState::GatewayUnauth);
    ingress.socket.set_peer_identity("S1".into());
    ingress.socket.set_state(ConnectionState::GatewayAuth);

    let outer = Envelope::new(MessageType::Proxy)
        .from_id("S1")
        .with_payload(&ProxyMessage {
            message_type: MessageType::Command,
            from: "P1".into(),
            to: "A3".into(),
            organization_id: "T1".into(),
            inner_message: None,
        })
        .unwrap();
    behaviors::dispatch(&node.app, &ingress.socket, outer, "").await.unwrap();

    assert!(agent.rx.try_recv().is_err());
    assert_eq!(
        node.app
            .stats
            .invalid_proxy_payloads
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

// ─── Scenario: gateway handshake ────────────────────────────────

#[tokio::test]
async fn gateway_handshake_authenticates_both_ends() {
    let verifier = node("G", Role::Gateway);
    let dialer = node("S1", Role::Service);

    // Verifier side issues the welcome nonce on ingress.
    let mut ingress = connect(&verifier, "c-in", ConnectionState::GatewayUnauth);
    ingress.socket.set_issued_nonce("N1".into());

    // Dialer side receives the welcome and answers the handshake.
    let mut outward = connect(&dialer, "c-out", ConnectionState::GatewayUnauth);
    let welcome = Envelope::new(MessageType::Welcome)
        .from_id("G")
        .with_payload(&relay_protocol::WelcomeMessage {
            public_key_hash: "h".into(),
            machine_name: "G".into(),
            server_version: "0".into(),
            nonce: Some("N1".into()),
            allowed_protocol_versions: vec![1],
        })
        .unwrap();
    behaviors::dispatch(&dialer.app, &outward.socket, welcome, "").await.unwrap();
    let handshake = outward.next_envelope(Wrapping::PlainText, &dialer.app.keys).await;
    assert_eq!(handshake.message_type, MessageType::AuthGateway);

    // Feed the handshake into the verifier; it accepts and replies.
    behaviors::dispatch(&verifier.app, &ingress.socket, handshake, "").await.unwrap();
    assert_eq!(ingress.socket.state(), ConnectionState::GatewayAuth);
    assert_eq!(ingress.socket.client_id().as_deref(), Some("S1"));

    let result = ingress.next_envelope(Wrapping::PlainText, &verifier.app.keys).await;
    behaviors::dispatch(&dialer.app, &outward.socket, result, "").await.unwrap();
    assert_eq!(outward.socket.state(), ConnectionState::GatewayAuth);
    assert_eq!(outward.socket.client_id().as_deref(), Some("G"));
}

#[tokio::test]
async fn wrong_handshake_hash_is_a_policy_violation() {
    let verifier = node("G", Role::Gateway);
    let ingress = connect(&verifier, "c-in", ConnectionState::GatewayUnauth);
    ingress.socket.set_issued_nonce("N1".into());

    let forged = Envelope::new(MessageType::AuthGateway)
        .from_id("S1")
        .with_payload(&relay_protocol::AuthGatewayMessage {
            nonce: "N2".into(),
            hash: "not the hash".into(),
        })
        .unwrap();
    let err = behaviors::dispatch(&verifier.app, &ingress.socket, forged, "")
        .await
        .unwrap_err();
    assert_eq!(err.close_reason(), "Incorrect gateway handshake");
    assert_eq!(ingress.socket.state(), ConnectionState::GatewayUnauth);
}

// ─── Scenario: control relay ────────────────────────────────────

#[tokio::test]
async fn control_request_for_an_unconnected_agent_fails_fast() {
    let node = node("S1", Role::Service);
    tokio::spawn(intake::run_control_intake(node.app.clone()));

    let reply = node
        .bus
        .inject_control(AgentControlCommandRequest {
            agent_id: "r-7".into(),
            organization_id: "T1".into(),
            command: "reboot".into(),
            settings: serde_json::json!({}),
        })
        .await
        .unwrap();
    let response = reply.await.unwrap();
    assert!(!response.success);
    assert_eq!(response.agent_id, "r-7");
    assert_eq!(response.message.as_deref(), Some("Client was not connected"));
}

#[tokio::test]
async fn control_request_times_out_when_the_agent_stays_silent() {
    let node = node("S1", Role::Service);
    let (_agent, _keys) = attach_agent(&node, "c-a1", "A1", "T1", Some("r-7")).await;
    tokio::spawn(intake::run_control_intake(node.app.clone()));

    let reply = node
        .bus
        .inject_control(AgentControlCommandRequest {
            agent_id: "r-7".into(),
            organization_id: "T1".into(),
            command: "reboot".into(),
            settings: serde_json::json!({}),
        })
        .await
        .unwrap();
    let response = reply.await.unwrap();
    assert!(!response.success);
    assert!(response
        .message
        .as_deref()
        .unwrap()
        .starts_with("Failed to send message to client"));
}

#[tokio::test]
async fn control_round_trip_completes_through_the_correlator() {
    let node = node("S1", Role::Service);
    let (mut agent, agent_keys) = attach_agent(&node, "c-a1", "A1", "T1", Some("r-7")).await;
    tokio::spawn(intake::run_control_intake(node.app.clone()));

    let reply = node
        .bus
        .inject_control(AgentControlCommandRequest {
            agent_id: "r-7".into(),
            organization_id: "T1".into(),
            command: "status".into(),
            settings: serde_json::json!({"verbose": true}),
        })
        .await
        .unwrap();

    // The agent receives the encrypted control request and answers it on
    // the same correlation id.
    let request = agent.next_envelope(Wrapping::Encrypt, &agent_keys).await;
    assert_eq!(request.message_type, MessageType::Control);
    let message_id = request.message_id.clone().unwrap();

    let mut response = Envelope::new(MessageType::Control).from_id("A1");
    response.message_id = Some(message_id);
    let response = response
        .with_payload(&ControlResponse {
            success: true,
            output: Some(serde_json::json!({"uptime": 42})),
            message: None,
        })
        .unwrap();
    behaviors::dispatch(&node.app, &agent.socket, response, "").await.unwrap();

    let answered = reply.await.unwrap();
    assert!(answered.success);
    assert_eq!(answered.settings, Some(serde_json::json!({"uptime": 42})));
}

#[tokio::test]
async fn orphan_control_response_is_relayed_to_the_interested_peer() {
    let node = node("G", Role::Gateway);
    let (agent, _) = attach_agent(&node, "c-a3", "A3", "T1", None).await;

    let mut peer = connect(&node, "c-s1", ConnectionState::GatewayUnauth);
    peer.socket.set_peer_identity("S1".into());
    peer.socket.set_state(ConnectionState::GatewayAuth);
    peer.socket.interest.mark_interest("T1", "A3");

    let mut response = Envelope::new(MessageType::Control).from_id("A3").to_id("S1");
    response.message_id = Some("m9".into());
    let response = response
        .with_payload(&ControlResponse {
            success: true,
            output: None,
            message: None,
        })
        .unwrap();
    behaviors::dispatch(&node.app, &agent.socket, response, "").await.unwrap();

    let outer = peer.next_envelope(Wrapping::PlainText, &node.app.keys).await;
    assert_eq!(outer.message_type, MessageType::Proxy);
    assert_eq!(outer.message_id.as_deref(), Some("m9"));
    let proxy: ProxyMessage = outer.payload_as().unwrap();
    assert_eq!(proxy.message_type, MessageType::Control);
    assert_eq!(proxy.from, "A3");
}

// ─── Scenario: oversize pre-auth frame ──────────────────────────

#[tokio::test]
async fn oversize_preauth_frame_closes_with_a_policy_violation() {
    let node = node("S1", Role::Service);
    let mut agent = connect(&node, "c-a1", ConnectionState::AgentUnauth);

    let oversized = "x".repeat(100_001);
    assert!(!process_frame(&node.app, &agent.socket, &oversized).await);

    let (code, reason) = agent.next_close().await;
    assert_eq!(code, CLOSE_POLICY_VIOLATION);
    assert!(reason.contains("Too much data"));
}

#[tokio::test]
async fn frame_without_a_usable_type_is_ignored() {
    let node = node("S1", Role::Service);
    let mut portal = connect(&node, "c-p1", ConnectionState::PortalUnauth);

    assert!(process_frame(&node.app, &portal.socket, "{\"foo\":1}").await);
    assert!(portal.rx.try_recv().is_err());
}

#[tokio::test]
async fn wrong_wrapping_for_the_state_closes_the_stream() {
    let node = node("S1", Role::Service);
    let mut agent = connect(&node, "c-a1", ConnectionState::AgentUnauth);

    // AgentUnauth expects Sign-Only; bare JSON must be rejected.
    let plain = serde_json::to_string(&Envelope::new(MessageType::Ping)).unwrap();
    assert!(!process_frame(&node.app, &agent.socket, &plain).await);
    let (code, _) = agent.next_close().await;
    assert_eq!(code, CLOSE_POLICY_VIOLATION);
}

// ─── Impersonation guard ────────────────────────────────────────

#[tokio::test]
async fn impersonated_portal_commands_are_denied() {
    let node = node("S1", Role::Service);
    accept_all_portals(&node.bus, "T1");
    let mut portal = connect(&node, "c-p1", ConnectionState::PortalUnauth);
    authenticate_portal(&node, &mut portal, "P1").await;
    portal.socket.set_impersonated(true);
    let (_agent, _) = attach_agent(&node, "c-a1", "A1", "T1", None).await;

    let command = Envelope::new(MessageType::Command).from_id("P1").to_id("A1");
    let err = behaviors::dispatch(&node.app, &portal.socket, command, "")
        .await
        .unwrap_err();
    assert_eq!(err.close_reason(), "Access denied");
}

// ─── Scenario: reconnect keeper ─────────────────────────────────

#[tokio::test]
async fn gateway_keeper_counts_failed_dial_attempts() {
    let config = Config {
        role: Role::Service,
        instance_id: "S1".into(),
        gateway_pre_shared_key: Some("psk".into()),
        // Nothing listens here; the dial fails immediately.
        gateway_servers: "ws://127.0.0.1:9/gateway".into(),
        ..Config::default()
    };
    let bus = Arc::new(InProcessBus::new());
    let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(300)));
    let app = AppState::new(
        Arc::new(config),
        Arc::new(NodeKeyPair::generate().unwrap()),
        registry,
        bus as Arc<dyn relay_server::bus::MessageBus>,
    );

    relay_server::gateway::spawn_gateway_keepers(&app);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        app.stats
            .gateway_failed_attempts
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
    app.shutdown.cancel();
}

// ─── List pushes on agent lifecycle ─────────────────────────────

#[tokio::test]
async fn proxied_list_trigger_pushes_to_local_portals() {
    let node = node("G", Role::Gateway);
    accept_all_portals(&node.bus, "T1");
    let mut portal = connect(&node, "c-p1", ConnectionState::PortalUnauth);
    authenticate_portal(&node, &mut portal, "P1").await;
    let (_agent, _) = attach_agent(&node, "c-a1", "A1", "T1", None).await;

    let ingress = connect(&node, "c-s1", ConnectionState::GatewayUnauth);
    ingress.socket.set_peer_identity("S1".into());
    ingress.socket.set_state(ConnectionState::GatewayAuth);

    let outer = Envelope::new(MessageType::Proxy)
        .from_id("S1")
        .with_payload(&ProxyMessage {
            message_type: MessageType::List,
            from: "S1".into(),
            to: "P1".into(),
            organization_id: "T1".into(),
            inner_message: None,
        })
        .unwrap();
    behaviors::dispatch(&node.app, &ingress.socket, outer, "").await.unwrap();

    let pushed = portal.next_envelope(Wrapping::PlainText, &node.app.keys).await;
    assert_eq!(pushed.message_type, MessageType::List);
    let agents: Vec<ClientRegistration> = pushed.payload_as().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].client_id, "A1");
}
