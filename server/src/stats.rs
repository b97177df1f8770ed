//! # Statistics Counters
//!
//! Node-wide monotonic counters. Plain atomic adds with wraparound; the
//! periodic sink and `GET /api/stats` read snapshots. No algorithms live
//! here, only the numbers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counter set for one node. Created once at startup, shared everywhere.
#[derive(Debug, Default)]
pub struct Stats {
    pub connections_accepted: AtomicU64,
    pub connections_closed: AtomicU64,
    pub policy_violations: AtomicU64,
    pub invalid_proxy_payloads: AtomicU64,
    pub bus_control_requests: AtomicU64,
    pub bus_control_timeouts: AtomicU64,
    pub gateway_failed_attempts: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

/// Point-in-time copy of every counter, serialized by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub policy_violations: u64,
    pub invalid_proxy_payloads: u64,
    pub bus_control_requests: u64,
    pub bus_control_timeouts: u64,
    pub gateway_failed_attempts: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl Stats {
    /// Wrapping add on one counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Bumps a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            policy_violations: self.policy_violations.load(Ordering::Relaxed),
            invalid_proxy_payloads: self.invalid_proxy_payloads.load(Ordering::Relaxed),
            bus_control_requests: self.bus_control_requests.load(Ordering::Relaxed),
            bus_control_timeouts: self.bus_control_timeouts.load(Ordering::Relaxed),
            gateway_failed_attempts: self.gateway_failed_attempts.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter. Driven by the daily purge when the statistics
    /// sink is enabled.
    pub fn reset(&self) {
        self.connections_accepted.store(0, Ordering::Relaxed);
        self.connections_closed.store(0, Ordering::Relaxed);
        self.policy_violations.store(0, Ordering::Relaxed);
        self.invalid_proxy_payloads.store(0, Ordering::Relaxed);
        self.bus_control_requests.store(0, Ordering::Relaxed);
        self.bus_control_timeouts.store(0, Ordering::Relaxed);
        self.gateway_failed_attempts.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
    }
}
