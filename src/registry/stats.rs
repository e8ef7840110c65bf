//! Registry Statistics
//!
//! Lock-free counters shared by the facade, the membership cache and the
//! subscription tasks.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for registry activity
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Successful register calls
    pub registrations: AtomicU64,
    /// Successful unregister calls
    pub unregistrations: AtomicU64,
    /// Lookup calls (resolved or not)
    pub lookups: AtomicU64,
    /// Raw messages received on subscribed channels
    pub events_received: AtomicU64,
    /// Events applied to the membership cache
    pub events_applied: AtomicU64,
    /// Non-fatal listener failures
    pub listener_faults: AtomicU64,
    /// Messages rejected by the event grammar
    pub protocol_faults: AtomicU64,
    /// Subscription tasks started
    pub subscription_starts: AtomicU64,
    /// Re-subscribe attempts after transport faults
    pub subscription_restarts: AtomicU64,
    /// Subscription tasks that ended without being cancelled
    pub subscription_failures: AtomicU64,
}

impl RegistryStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            registrations: self.registrations.load(Ordering::Relaxed),
            unregistrations: self.unregistrations.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            listener_faults: self.listener_faults.load(Ordering::Relaxed),
            protocol_faults: self.protocol_faults.load(Ordering::Relaxed),
            subscription_starts: self.subscription_starts.load(Ordering::Relaxed),
            subscription_restarts: self.subscription_restarts.load(Ordering::Relaxed),
            subscription_failures: self.subscription_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatsSnapshot {
    pub registrations: u64,
    pub unregistrations: u64,
    pub lookups: u64,
    pub events_received: u64,
    pub events_applied: u64,
    pub listener_faults: u64,
    pub protocol_faults: u64,
    pub subscription_starts: u64,
    pub subscription_restarts: u64,
    pub subscription_failures: u64,
}
