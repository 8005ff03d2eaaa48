//! Cache Metrics Collection
//!
//! Counters for monitoring cache effectiveness and population health.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookup outcomes
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,

    // Population
    builds: AtomicU64,
    joined_waits: AtomicU64,
    lock_timeouts: AtomicU64,
    origin_failures: AtomicU64,
    uncacheable: AtomicU64,

    // Filter
    bypasses: AtomicU64,
    reentrant: AtomicU64,
    committed: AtomicU64,

    // Negotiation
    not_modified: AtomicU64,
    gzip_responses: AtomicU64,
    bytes_served: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_joined_wait(&self) {
        self.joined_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_origin_failure(&self) {
        self.origin_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uncacheable(&self) {
        self.uncacheable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reentrant(&self) {
        self.reentrant.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_modified(&self) {
        self.not_modified.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a written body and whether it went out gzip-encoded
    pub fn record_body(&self, bytes: u64, gzip: bool) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
        if gzip {
            self.gzip_responses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Hits over all lookups
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Take a point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            stale: self.stale.load(Ordering::Relaxed),
            builds: self.builds(),
            joined_waits: self.joined_waits.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            origin_failures: self.origin_failures.load(Ordering::Relaxed),
            uncacheable: self.uncacheable.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            reentrant: self.reentrant.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            gzip_responses: self.gzip_responses.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub stale: u64,
    pub builds: u64,
    pub joined_waits: u64,
    pub lock_timeouts: u64,
    pub origin_failures: u64,
    pub uncacheable: u64,
    pub bypasses: u64,
    pub reentrant: u64,
    pub committed: u64,
    pub not_modified: u64,
    pub gzip_responses: u64,
    pub bytes_served: u64,
    pub hit_ratio: f64,
}

impl MetricsSnapshot {
    /// Counter name/value pairs, for exposition
    pub fn counters(&self) -> [(&'static str, u64); 14] {
        [
            ("hits", self.hits),
            ("misses", self.misses),
            ("stale", self.stale),
            ("builds", self.builds),
            ("joined_waits", self.joined_waits),
            ("lock_timeouts", self.lock_timeouts),
            ("origin_failures", self.origin_failures),
            ("uncacheable", self.uncacheable),
            ("bypasses", self.bypasses),
            ("reentrant", self.reentrant),
            ("committed", self.committed),
            ("not_modified", self.not_modified),
            ("gzip_responses", self.gzip_responses),
            ("bytes_served", self.bytes_served),
        ]
    }
}
