//! Cache Metrics Collection
//!
//! Event and maintenance counters for monitoring cache health.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{IntCounter, Registry, TextEncoder};
use serde::Serialize;

use crate::error::Result;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Directory events
    events_created: AtomicU64,
    events_modified: AtomicU64,
    events_removed: AtomicU64,

    // Shard mutations
    shard_updates: AtomicU64,
    shard_failures: AtomicU64,

    // Maintenance
    cleanup_runs: AtomicU64,
    entries_purged: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // Events
    pub fn record_create(&self) {
        self.events_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_modify(&self) {
        self.events_modified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remove(&self) {
        self.events_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Total number of dispatched events
    pub fn events(&self) -> u64 {
        self.events_created.load(Ordering::Relaxed)
            + self.events_modified.load(Ordering::Relaxed)
            + self.events_removed.load(Ordering::Relaxed)
    }

    // Shards
    pub fn record_shard_update(&self) {
        self.shard_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shard_failure(&self) {
        self.shard_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shard_failures(&self) -> u64 {
        self.shard_failures.load(Ordering::Relaxed)
    }

    // Cleanup
    pub fn record_cleanup(&self, purged: u64) {
        self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        self.entries_purged.fetch_add(purged, Ordering::Relaxed);
    }

    pub fn cleanup_runs(&self) -> u64 {
        self.cleanup_runs.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_created: self.events_created.load(Ordering::Relaxed),
            events_modified: self.events_modified.load(Ordering::Relaxed),
            events_removed: self.events_removed.load(Ordering::Relaxed),
            shard_updates: self.shard_updates.load(Ordering::Relaxed),
            shard_failures: self.shard_failures.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            entries_purged: self.entries_purged.load(Ordering::Relaxed),
        }
    }

    /// Render the counters in Prometheus text exposition format
    pub fn to_prometheus(&self) -> Result<String> {
        let snapshot = self.snapshot();
        let registry = Registry::new();

        for (name, help, value) in [
            ("dircache_events_created_total", "Directory create events dispatched", snapshot.events_created),
            ("dircache_events_modified_total", "Directory modify events dispatched", snapshot.events_modified),
            ("dircache_events_removed_total", "Directory remove events dispatched", snapshot.events_removed),
            ("dircache_shard_updates_total", "Shard mutations applied", snapshot.shard_updates),
            ("dircache_shard_failures_total", "Shard mutations that failed", snapshot.shard_failures),
            ("dircache_cleanup_runs_total", "Cleanup passes over all shards", snapshot.cleanup_runs),
            ("dircache_entries_purged_total", "Stale shard records removed by cleanup", snapshot.entries_purged),
        ] {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        Ok(TextEncoder::new().encode_to_string(&registry.gather())?)
    }
}

/// Snapshot of cache metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_created: u64,
    pub events_modified: u64,
    pub events_removed: u64,
    pub shard_updates: u64,
    pub shard_failures: u64,
    pub cleanup_runs: u64,
    pub entries_purged: u64,
}
