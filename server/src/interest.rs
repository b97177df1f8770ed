//! # Recent-Interest Map
//!
//! Each gateway peer connection carries a short-TTL set of
//! `(organizationId, clientId)` pairs that were recently proxied through it.
//! Return-path routing consults it when the registry gives no route: the
//! peer that forwarded a request is the peer the reply goes back through.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Entries expire after this long.
const INTEREST_TTL: Duration = Duration::from_secs(300);

/// Expired entries are swept lazily, and only once the map has grown to at
/// least this many entries with a full TTL elapsed since the last sweep.
const CLEANUP_THRESHOLD: usize = 25;

/// TTL set of tenant/client pairs proxied through one gateway peer.
///
/// Guarded by its own mutex; every operation is a short critical section
/// that never awaits.
#[derive(Debug)]
pub struct RecentInterestMap {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<(String, String), Instant>,
    last_cleanup: Instant,
}

impl RecentInterestMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Records that traffic for `(organization_id, client_id)` passed through
    /// this peer, refreshing the TTL if the pair is already present.
    pub fn mark_interest(&self, organization_id: &str, client_id: &str) {
        let mut inner = self.inner.lock().expect("interest map lock");
        let now = Instant::now();
        inner
            .entries
            .insert((organization_id.to_string(), client_id.to_string()), now);
        maybe_cleanup(&mut inner, now);
    }

    /// Whether a live (non-expired) entry exists for the pair.
    pub fn contains(&self, organization_id: &str, client_id: &str) -> bool {
        let inner = self.inner.lock().expect("interest map lock");
        inner
            .entries
            .get(&(organization_id.to_string(), client_id.to_string()))
            .map(|marked| marked.elapsed() < INTEREST_TTL)
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("interest map lock").entries.len()
    }
}

impl Default for RecentInterestMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy sweep: drop expired entries once the map is big enough and a TTL has
/// passed since the previous sweep.
fn maybe_cleanup(inner: &mut Inner, now: Instant) {
    if inner.entries.len() < CLEANUP_THRESHOLD {
        return;
    }
    if now.duration_since(inner.last_cleanup) < INTEREST_TTL {
        return;
    }
    inner.entries.retain(|_, marked| marked.elapsed() < INTEREST_TTL);
    inner.last_cleanup = now;
}
