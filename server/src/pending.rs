//! # Pending-Response Correlator
//!
//! Control requests relayed to an agent complete asynchronously: the reply
//! arrives on whatever stream the agent is attached to, possibly proxied
//! through a gateway peer. This map holds the unresolved correlations,
//! keyed by `(organizationId, clientId, messageId)`.
//!
//! Delivery is single-shot. Completion hands the response to a oneshot
//! channel, so the awaiting task is resumed through the scheduler and never
//! inside this map's lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_protocol::ControlResponse;
use tokio::sync::oneshot;

/// Builds the tenant-scoped correlation key.
pub fn pending_key(organization_id: &str, client_id: &str, message_id: &str) -> String {
    format!("{organization_id}:{client_id}:{message_id}")
}

/// Map of unresolved request/reply correlations.
#[derive(Debug, Clone, Default)]
pub struct PendingResponses {
    entries: Arc<Mutex<HashMap<String, oneshot::Sender<ControlResponse>>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending response and returns the ticket the requester
    /// awaits. Dropping the ticket (timeout, cancellation) removes the
    /// entry, so an abandoned wait never leaks.
    pub fn prepare(&self, key: String) -> PendingTicket {
        let (tx, rx) = oneshot::channel();
        self.entries
            .lock()
            .expect("pending map lock")
            .insert(key.clone(), tx);
        PendingTicket {
            key,
            rx: Some(rx),
            entries: Arc::clone(&self.entries),
        }
    }

    /// Completes a pending response. Returns `true` when a waiter was
    /// matched; a duplicate completion or a completion after cancellation
    /// finds no entry and is a no-op.
    pub fn complete(&self, key: &str, response: ControlResponse) -> bool {
        let sender = self.entries.lock().expect("pending map lock").remove(key);
        match sender {
            // The send only fails if the waiter already gave up; either way
            // the entry is gone.
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Whether a correlation is currently registered. Used by the response
    /// return path to decide between local completion and gateway relay.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().expect("pending map lock").contains_key(key)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("pending map lock").len()
    }
}

/// A registered correlation, held by the requester while it waits.
pub struct PendingTicket {
    key: String,
    rx: Option<oneshot::Receiver<ControlResponse>>,
    entries: Arc<Mutex<HashMap<String, oneshot::Sender<ControlResponse>>>>,
}

impl PendingTicket {
    /// Waits for the response up to the deadline. `None` means the deadline
    /// elapsed or the entry was cancelled; the drop at the end of the wait
    /// removes the entry either way.
    pub async fn wait(mut self, deadline: Duration) -> Option<ControlResponse> {
        let rx = self.rx.take()?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Some(response),
            _ => None,
        }
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        self.entries.lock().expect("pending map lock").remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(message: &str) -> ControlResponse {
        ControlResponse {
            success: true,
            output: None,
            message: Some(message.into()),
        }
    }

    #[tokio::test]
    async fn completion_reaches_the_waiter_exactly_once() {
        let pending = PendingResponses::new();
        let key = pending_key("T1", "A1", "m1");
        let ticket = pending.prepare(key.clone());

        assert!(pending.complete(&key, response("first")));
        // Second completion finds no entry.
        assert!(!pending.complete(&key, response("second")));

        let got = ticket.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.message.as_deref(), Some("first"));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_the_entry() {
        let pending = PendingResponses::new();
        let key = pending_key("T1", "A1", "m2");
        let ticket = pending.prepare(key.clone());

        assert!(ticket.wait(Duration::from_millis(10)).await.is_none());
        assert_eq!(pending.len(), 0);
        // Completion after cancellation is a no-op.
        assert!(!pending.complete(&key, response("late")));
    }

    #[tokio::test]
    async fn dropping_the_ticket_cancels_the_entry() {
        let pending = PendingResponses::new();
        let key = pending_key("T1", "A1", "m3");
        let ticket = pending.prepare(key.clone());
        assert!(pending.contains(&key));
        drop(ticket);
        assert!(!pending.contains(&key));
    }

    #[test]
    fn keys_are_tenant_scoped() {
        assert_ne!(pending_key("T1", "A1", "m"), pending_key("T2", "A1", "m"));
    }
}
