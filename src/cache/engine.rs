//! Cache Engine
//!
//! Owns the active shard set, routes directory changes to the shards that
//! are interested in them and runs the periodic cleanup.
//!
//! # Dispatch
//!
//! ```text
//! create(new)        -> every shard matching new:       add(new)
//! modify(old, new)   -> every shard matching old OR new: rm(old), add(new) if it matches new
//! remove(old)        -> every shard matching old:       rm(old)
//! ```
//!
//! A failing shard never blocks the others: all shards are attempted, then
//! the failures are reported together.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::builtin;
use super::config::CacheConfig;
use super::metrics::CacheMetrics;
use crate::directory::{DirectoryObject, Filter};
use crate::error::{Error, Result};
use crate::registry::ShardRegistry;
use crate::shard::{IndexStore, Reader, ReaderHandle, Shard};

/// Selector for [`CacheEngine::shards_for_query`]
#[derive(Debug, Clone, Copy)]
pub enum ShardQuery<'a> {
    /// Shards whose filter accepts the object
    Object(&'a DirectoryObject),
    /// Shards subscribed with the same filter
    Filter(&'a Filter),
}

impl<'a> From<&'a DirectoryObject> for ShardQuery<'a> {
    fn from(obj: &'a DirectoryObject) -> Self {
        ShardQuery::Object(obj)
    }
}

impl<'a> From<&'a Filter> for ShardQuery<'a> {
    fn from(filter: &'a Filter) -> Self {
        ShardQuery::Filter(filter)
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    /// When the pass started
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the pass
    pub duration: Duration,
    /// Records purged, per shard
    pub purged: Vec<(String, usize)>,
}

impl CleanupReport {
    /// Records purged over all shards
    pub fn total_purged(&self) -> usize {
        self.purged.iter().map(|(_, n)| n).sum()
    }
}

/// The directory attribute cache
pub struct CacheEngine {
    config: CacheConfig,
    store: IndexStore,
    registry: ShardRegistry,
    shards: RwLock<Vec<Arc<Shard>>>,
    events_since_cleanup: AtomicU64,
    metrics: CacheMetrics,
}

impl CacheEngine {
    /// Open the store and activate the built-in and registered shards.
    ///
    /// A store that cannot be opened is a configuration error. Malformed
    /// definitions are skipped with a warning.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let store = IndexStore::open(&config.cache_dir, config.map_size_mb, config.max_shards)
            .map_err(|e| {
                Error::Config(format!(
                    "cannot open cache store at {}: {}",
                    config.cache_dir.display(),
                    e
                ))
            })?;
        let registry = ShardRegistry::new(&config.shard_config);
        let shards = build_shards(&store, &config, &registry)?;

        info!(
            cache_dir = %config.cache_dir.display(),
            shards = shards.len(),
            "Cache engine ready"
        );
        Ok(Self {
            config,
            store,
            registry,
            shards: RwLock::new(shards),
            events_since_cleanup: AtomicU64::new(0),
            metrics: CacheMetrics::new(),
        })
    }

    /// Re-read the registry and rebuild the shard set. Databases of shards
    /// that stay active keep their contents.
    pub fn reload(&self) -> Result<()> {
        let shards = build_shards(&self.store, &self.config, &self.registry)?;
        info!(shards = shards.len(), "Reloaded shard definitions");
        *self.shards.write() = shards;
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    // =========================================================================
    // Shard lookup
    // =========================================================================

    /// Active shard by name
    pub fn get_sub_cache(&self, name: &str) -> Result<Arc<Shard>> {
        self.shards
            .read()
            .iter()
            .find(|shard| shard.name() == name)
            .cloned()
            .ok_or_else(|| Error::UnknownShard(name.to_string()))
    }

    /// Every active shard, in activation order
    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.read().clone()
    }

    pub fn shards_for_query<'a>(&self, query: impl Into<ShardQuery<'a>>) -> Vec<Arc<Shard>> {
        match query.into() {
            ShardQuery::Object(obj) => self.shards_for_object(obj),
            ShardQuery::Filter(filter) => self.shards_for_filter(filter),
        }
    }

    /// Shards whose filter accepts `obj`
    pub fn shards_for_object(&self, obj: &DirectoryObject) -> Vec<Arc<Shard>> {
        self.shards
            .read()
            .iter()
            .filter(|shard| shard.matches(obj))
            .cloned()
            .collect()
    }

    /// Shards whose filter is canonically equal to `filter`
    pub fn shards_for_filter(&self, filter: &Filter) -> Vec<Arc<Shard>> {
        let wanted = filter.to_string();
        self.shards
            .read()
            .iter()
            .filter(|shard| shard.filter().to_string() == wanted)
            .cloned()
            .collect()
    }

    /// Distinct subscription filters, one per group of shards sharing one
    pub fn listener_filters(&self) -> Vec<Filter> {
        let mut distinct = BTreeMap::new();
        for shard in self.shards.read().iter() {
            distinct
                .entry(shard.filter().to_string())
                .or_insert_with(|| shard.filter().clone());
        }
        distinct.into_values().collect()
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Read transaction spanning every shard. Independent of any other
    /// reader the calling thread holds.
    pub fn read(&self) -> Result<Reader> {
        self.store.read()
    }

    /// Reuse `outer` or acquire a new reader; see [`IndexStore::reading`]
    pub fn reading<'r>(&self, outer: Option<&'r Reader>) -> Result<ReaderHandle<'r>> {
        self.store.reading(outer)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// A new object appeared in the directory
    pub fn dispatch_create(&self, new: &DirectoryObject) -> Result<()> {
        self.metrics.record_create();
        debug!(dn = %new.dn, "Dispatching create");

        let failed = self
            .shards_for_object(new)
            .iter()
            .filter_map(|shard| self.apply(shard, &new.dn, || shard.add_object(new)))
            .collect();
        self.finish_dispatch(&new.dn, failed)
    }

    /// An object changed. `old.dn` carries the previous DN of a renamed
    /// object.
    pub fn dispatch_modify(&self, old: &DirectoryObject, new: &DirectoryObject) -> Result<()> {
        self.metrics.record_modify();
        debug!(dn = %new.dn, old_dn = %old.dn, "Dispatching modify");

        let failed = self
            .shards()
            .iter()
            .filter(|shard| shard.matches(old) || shard.matches(new))
            .filter_map(|shard| {
                let keep = shard.matches(new).then_some(new);
                self.apply(shard, &new.dn, || shard.replace(Some(old), keep))
            })
            .collect();
        self.finish_dispatch(&new.dn, failed)
    }

    /// An object disappeared from the directory
    pub fn dispatch_remove(&self, old: &DirectoryObject) -> Result<()> {
        self.metrics.record_remove();
        debug!(dn = %old.dn, "Dispatching remove");

        let failed = self
            .shards_for_object(old)
            .iter()
            .filter_map(|shard| self.apply(shard, &old.dn, || shard.rm_object(old)))
            .collect();
        self.finish_dispatch(&old.dn, failed)
    }

    /// Run one shard mutation; the shard name on failure
    fn apply(&self, shard: &Shard, dn: &str, op: impl FnOnce() -> Result<()>) -> Option<String> {
        match op() {
            Ok(()) => {
                self.metrics.record_shard_update();
                None
            }
            Err(e) => {
                self.metrics.record_shard_failure();
                error!(shard = %shard.name(), dn = %dn, error = %e, "Failed to update shard");
                Some(shard.name().to_string())
            }
        }
    }

    fn finish_dispatch(&self, dn: &str, failed: Vec<String>) -> Result<()> {
        if let Err(e) = self.maybe_cleanup() {
            error!(error = %e, "Periodic cleanup failed");
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::DispatchFailed {
                dn: dn.to_string(),
                shards: failed,
            })
        }
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Count one event and clean up when the interval is reached
    pub fn maybe_cleanup(&self) -> Result<Option<CleanupReport>> {
        let interval = self.config.cleanup_interval;
        let count = self.events_since_cleanup.fetch_add(1, Ordering::AcqRel) + 1;
        if interval == 0 || count < interval {
            return Ok(None);
        }
        // Lost race: a concurrent event counted past us and retries
        if self
            .events_since_cleanup
            .compare_exchange(count, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Ok(None);
        }
        self.cleanup().map(Some)
    }

    /// Events dispatched since the last cleanup
    pub fn events_since_cleanup(&self) -> u64 {
        self.events_since_cleanup.load(Ordering::Acquire)
    }

    /// Clean up every shard now and reset the event counter.
    ///
    /// A failing shard does not stop the pass; failures are reported once
    /// every shard was attempted.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        self.cleanup_with(Shard::cleanup)
    }

    fn cleanup_with(&self, op: impl Fn(&Shard) -> Result<usize>) -> Result<CleanupReport> {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut purged = Vec::new();
        let mut failed = Vec::new();
        for shard in self.shards() {
            match op(shard.as_ref()) {
                Ok(n) => purged.push((shard.name().to_string(), n)),
                Err(e) => {
                    error!(shard = %shard.name(), error = %e, "Failed to clean up shard");
                    failed.push(shard.name().to_string());
                }
            }
        }
        self.events_since_cleanup.store(0, Ordering::Release);

        let report = CleanupReport {
            started_at,
            duration: start.elapsed(),
            purged,
        };
        self.metrics.record_cleanup(report.total_purged() as u64);
        info!(
            purged = report.total_purged(),
            failed = failed.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Cleanup finished"
        );

        if failed.is_empty() {
            Ok(report)
        } else {
            Err(Error::CleanupFailed { shards: failed })
        }
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("config", &self.config)
            .field("shards", &*self.shards.read())
            .finish()
    }
}

/// Built-in shards followed by the registered ones; the first definition of
/// a name wins
fn build_shards(
    store: &IndexStore,
    config: &CacheConfig,
    registry: &ShardRegistry,
) -> Result<Vec<Arc<Shard>>> {
    let mut definitions = Vec::new();
    if config.builtin_shards {
        definitions.extend(builtin::definitions());
    }
    definitions.extend(registry.load_definitions());

    let mut names = HashSet::new();
    let mut shards = Vec::with_capacity(definitions.len());
    for def in definitions {
        if names.contains(def.db_name()) {
            warn!(shard = %def.db_name(), "Skipping shard with duplicate name");
            continue;
        }
        match Shard::open(store, def.clone()) {
            Ok(shard) => {
                names.insert(def.db_name().to_string());
                shards.push(Arc::new(shard));
            }
            Err(e @ (Error::InvalidDefinition(_) | Error::InvalidFilter { .. })) => {
                warn!(shard = %def, error = %e, "Skipping malformed shard definition");
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "cannot open shard {}: {}",
                    def.db_name(),
                    e
                )));
            }
        }
    }
    Ok(shards)
}

// =============================================================================
// Tests
// =============================================================================
