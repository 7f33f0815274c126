//! Observable counters.
//!
//! Shipping these to a metrics sink is out of scope for this crate (that's
//! the embedding application's job); exposing them is not. [`Stats`] is a
//! point-in-time snapshot assembled from every component's own counters,
//! the way the teacher's `PoolStats`/`CacheStats` types are assembled from
//! `AtomicU64`s behind a `.stats()` accessor.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::coordinator::Coordinator;
use crate::gateway::Gateway;

/// A snapshot of every counter named in the external interface.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub loader_invocations: u64,
    pub local_hits: u64,
    pub local_misses: u64,
    pub db_reads: u64,
    pub db_writes: u64,
    pub events_received: u64,
    pub events_discarded: u64,
    pub listener_reconnects: u64,
}

/// Counters owned directly by the facade: local-tier hit/miss and listener
/// bookkeeping that no single lower-level component is positioned to track.
#[derive(Default)]
pub struct FacadeCounters {
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    events_received: AtomicU64,
    events_discarded: AtomicU64,
    listener_reconnects: AtomicU64,
}

impl FacadeCounters {
    pub fn record_local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_miss(&self) {
        self.local_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_discarded(&self) {
        self.events_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_reconnect(&self) {
        self.listener_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Raw event counters, used by the listener's own tests; the full
    /// snapshot additionally needs a live gateway and coordinator.
    #[cfg(test)]
    pub(crate) fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn events_discarded(&self) -> u64 {
        self.events_discarded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, gateway: &Gateway, coordinator: &Coordinator) -> Stats {
        let gateway_stats = gateway.stats();
        Stats {
            loader_invocations: coordinator.loader_invocations(),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            local_misses: self.local_misses.load(Ordering::Relaxed),
            db_reads: gateway_stats.db_reads,
            db_writes: gateway_stats.db_writes,
            events_received: self.events_received.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            listener_reconnects: self.listener_reconnects.load(Ordering::Relaxed),
        }
    }
}
