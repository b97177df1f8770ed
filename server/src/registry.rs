//! # Tenant Registry
//!
//! Tracks which tenants' clients are attached where in the fleet. Every row
//! is keyed `(organizationId, clientId)` and stamped with the instance id of
//! the node terminating the stream, which is what cross-node command routing
//! keys off.
//!
//! The durable store behind this interface is an external collaborator; the
//! in-memory implementation here backs single-node deployments (the
//! `in_memory_client_list` setting) and the tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use relay_protocol::{ClientRegistration, ClientType};

/// Fields written when a client authenticates.
#[derive(Debug, Clone)]
pub struct NewRegistration {
    pub client_type: ClientType,
    pub connection_id: String,
    pub client_id: String,
    pub organization_id: String,
    pub registered_agent_id: Option<String>,
    pub client_version: Option<String>,
    pub gateway_id: Option<String>,
    pub client_ip: Option<String>,
}

/// The five registry operations, all tenant-scoped.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Create-or-update on `(organizationId, clientId)`; a second call for
    /// the same key refreshes the fields and `lastUpdatedOn` only.
    async fn register(&self, registration: NewRegistration) -> bool;

    /// Bumps `lastUpdatedOn`. Returns `true` iff the row exists.
    async fn update_activity(&self, client_id: &str, organization_id: &str) -> bool;

    /// Removes the row and records final byte counters. Deregistering an
    /// absent key returns `true`; the outcome is the same either way.
    async fn deregister(
        &self,
        connection_id: &str,
        client_id: &str,
        organization_id: &str,
        bytes_received: u64,
        bytes_sent: u64,
    ) -> bool;

    /// A tenant's agents with activity inside the liveness window.
    async fn get_agents(&self, organization_id: &str) -> Vec<ClientRegistration>;

    /// A tenant's portals with activity inside the liveness window.
    async fn get_portals(&self, organization_id: &str) -> Vec<ClientRegistration>;

    /// Drops rows older than the retention window. Returns how many went.
    async fn purge_stale(&self, retention: Duration) -> usize;
}

// ─── In-Memory Implementation ───────────────────────────────────

/// DashMap-backed registry for single-node deployments and tests.
#[derive(Debug)]
pub struct InMemoryRegistry {
    rows: DashMap<(String, String), StoredRow>,
    inactivity_window: Duration,
}

#[derive(Debug, Clone)]
struct StoredRow {
    registration: ClientRegistration,
    #[allow(dead_code)]
    connection_id: String,
    #[allow(dead_code)]
    client_ip: Option<String>,
}

impl InMemoryRegistry {
    pub fn new(inactivity_window: Duration) -> Self {
        Self {
            rows: DashMap::new(),
            inactivity_window,
        }
    }

    fn live_rows(&self, organization_id: &str, client_type: ClientType) -> Vec<ClientRegistration> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.inactivity_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        self.rows
            .iter()
            .filter(|e| {
                let row = &e.value().registration;
                row.organization_id == organization_id
                    && row.client_type == client_type
                    && row.last_updated_on >= cutoff
            })
            .map(|e| e.value().registration.clone())
            .collect()
    }
}

#[async_trait]
impl ClientRegistry for InMemoryRegistry {
    async fn register(&self, registration: NewRegistration) -> bool {
        let key = (
            registration.organization_id.clone(),
            registration.client_id.clone(),
        );
        let row = StoredRow {
            registration: ClientRegistration {
                client_id: registration.client_id,
                organization_id: registration.organization_id,
                client_type: registration.client_type,
                machine_registration_id: registration.registered_agent_id,
                client_version: registration.client_version,
                gateway_id: registration.gateway_id,
                last_updated_on: Utc::now(),
            },
            connection_id: registration.connection_id,
            client_ip: registration.client_ip,
        };
        self.rows.insert(key, row);
        true
    }

    async fn update_activity(&self, client_id: &str, organization_id: &str) -> bool {
        match self
            .rows
            .get_mut(&(organization_id.to_string(), client_id.to_string()))
        {
            Some(mut row) => {
                row.registration.last_updated_on = Utc::now();
                true
            }
            None => false,
        }
    }

    async fn deregister(
        &self,
        _connection_id: &str,
        client_id: &str,
        organization_id: &str,
        _bytes_received: u64,
        _bytes_sent: u64,
    ) -> bool {
        self.rows
            .remove(&(organization_id.to_string(), client_id.to_string()));
        true
    }

    async fn get_agents(&self, organization_id: &str) -> Vec<ClientRegistration> {
        self.live_rows(organization_id, ClientType::Agent)
    }

    async fn get_portals(&self, organization_id: &str) -> Vec<ClientRegistration> {
        self.live_rows(organization_id, ClientType::Portal)
    }

    async fn purge_stale(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(1));
        let before = self.rows.len();
        self.rows
            .retain(|_, row| row.registration.last_updated_on >= cutoff);
        before - self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(client_id: &str, org: &str, client_type: ClientType) -> NewRegistration {
        NewRegistration {
            client_type,
            connection_id: format!("conn-{client_id}"),
            client_id: client_id.into(),
            organization_id: org.into(),
            registered_agent_id: None,
            client_version: Some("1".into()),
            gateway_id: Some("node-1".into()),
            client_ip: None,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_on_the_tenant_scoped_key() {
        let registry = InMemoryRegistry::new(Duration::from_secs(300));
        assert!(registry.register(registration("A1", "T1", ClientType::Agent)).await);
        assert!(registry.register(registration("A1", "T1", ClientType::Agent)).await);
        assert_eq!(registry.get_agents("T1").await.len(), 1);
    }

    #[tokio::test]
    async fn listings_are_tenant_and_type_scoped() {
        let registry = InMemoryRegistry::new(Duration::from_secs(300));
        registry.register(registration("A1", "T1", ClientType::Agent)).await;
        registry.register(registration("P1", "T1", ClientType::Portal)).await;
        registry.register(registration("A2", "T2", ClientType::Agent)).await;

        let agents = registry.get_agents("T1").await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].client_id, "A1");
        assert_eq!(registry.get_portals("T1").await.len(), 1);
        assert!(registry.get_agents("T3").await.is_empty());
    }

    #[tokio::test]
    async fn deregister_of_an_absent_key_is_a_true_no_op() {
        let registry = InMemoryRegistry::new(Duration::from_secs(300));
        assert!(registry.deregister("c", "A9", "T1", 0, 0).await);
    }

    #[tokio::test]
    async fn update_activity_reports_row_existence() {
        let registry = InMemoryRegistry::new(Duration::from_secs(300));
        registry.register(registration("A1", "T1", ClientType::Agent)).await;
        assert!(registry.update_activity("A1", "T1").await);
        assert!(!registry.update_activity("A2", "T1").await);
    }

    #[tokio::test]
    async fn purge_drops_rows_past_the_retention_window() {
        let registry = InMemoryRegistry::new(Duration::from_secs(300));
        registry.register(registration("A1", "T1", ClientType::Agent)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.purge_stale(Duration::ZERO).await, 1);
        assert_eq!(registry.purge_stale(Duration::ZERO).await, 0);
    }

    #[tokio::test]
    async fn inactive_rows_fall_out_of_listings() {
        // Zero-width liveness window: everything is immediately inactive.
        let registry = InMemoryRegistry::new(Duration::ZERO);
        registry.register(registration("A1", "T1", ClientType::Agent)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.get_agents("T1").await.is_empty());
    }
}
