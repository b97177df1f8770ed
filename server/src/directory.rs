//! # Local Connection Directory
//!
//! Tracks the streams attached to this node: one list for client
//! connections (Portals and Agents), one for gateway peers. Gateway peers
//! are direction-agnostic — outward-dialed connections on a service node
//! and inbound `/gateway` connections on a gateway node both land in the
//! same list, so routing treats them identically.
//!
//! Lookups return snapshots or cloned `Arc`s; callers never iterate while
//! holding a shard lock.

use std::sync::Arc;

use dashmap::DashMap;

use crate::socket::{ConnectionState, SocketRole, SocketState};

/// Registry of locally-attached streams, keyed by connection id.
#[derive(Debug, Default)]
pub struct ConnectionDirectory {
    clients: DashMap<String, Arc<SocketState>>,
    gateways: DashMap<String, Arc<SocketState>>,
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Client connections (Portals and Agents) ──

    pub fn add_client(&self, socket: Arc<SocketState>) {
        self.clients.insert(socket.connection_id.clone(), socket);
    }

    pub fn remove_client(&self, connection_id: &str) -> Option<Arc<SocketState>> {
        self.clients.remove(connection_id).map(|(_, socket)| socket)
    }

    /// Copy of the current client list, safe to iterate without locks.
    pub fn snapshot_clients(&self) -> Vec<Arc<SocketState>> {
        self.clients.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// First client connection matching the predicate.
    pub fn first_client_where<F>(&self, predicate: F) -> Option<Arc<SocketState>>
    where
        F: Fn(&SocketState) -> bool,
    {
        self.clients
            .iter()
            .find(|e| predicate(e.value()))
            .map(|e| Arc::clone(e.value()))
    }

    /// The authenticated local connection for a tenant's client of the given
    /// kind, when it is attached here.
    pub fn find_local_client(
        &self,
        organization_id: &str,
        client_id: &str,
        role: SocketRole,
    ) -> Option<Arc<SocketState>> {
        self.first_client_where(|socket| {
            socket.is_authenticated()
                && socket.state().socket_role() == role
                && socket.client_id().as_deref() == Some(client_id)
                && socket.organization_id().as_deref() == Some(organization_id)
        })
    }

    /// Every authenticated Portal of a tenant attached to this node.
    pub fn local_portals(&self, organization_id: &str) -> Vec<Arc<SocketState>> {
        self.clients
            .iter()
            .filter(|e| {
                let socket = e.value();
                socket.state() == ConnectionState::PortalAuth
                    && socket.organization_id().as_deref() == Some(organization_id)
            })
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    // ── Gateway peers ──

    pub fn add_gateway(&self, socket: Arc<SocketState>) {
        self.gateways.insert(socket.connection_id.clone(), socket);
    }

    pub fn remove_gateway(&self, connection_id: &str) -> Option<Arc<SocketState>> {
        self.gateways.remove(connection_id).map(|(_, socket)| socket)
    }

    pub fn snapshot_gateways(&self) -> Vec<Arc<SocketState>> {
        self.gateways.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// The authenticated gateway peer whose instance id matches a registry
    /// row's `gatewayId`, if any. This is routing rule 1 for commands.
    pub fn find_gateway_peer(&self, instance_id: &str) -> Option<Arc<SocketState>> {
        self.gateways
            .iter()
            .find(|e| {
                let socket = e.value();
                socket.state() == ConnectionState::GatewayAuth
                    && socket.client_id().as_deref() == Some(instance_id)
            })
            .map(|e| Arc::clone(e.value()))
    }

    /// Authenticated gateway peers whose recent-interest map holds the
    /// tenant/client pair. The return path for replies when the registry
    /// gives no route.
    pub fn where_relevant_to(
        &self,
        organization_id: &str,
        client_id: &str,
    ) -> Vec<Arc<SocketState>> {
        self.gateways
            .iter()
            .filter(|e| {
                let socket = e.value();
                socket.state() == ConnectionState::GatewayAuth
                    && socket.interest.contains(organization_id, client_id)
            })
            .map(|e| Arc::clone(e.value()))
            .collect()
    }
}
