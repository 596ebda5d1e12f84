//! Directory Attribute Cache
//!
//! The engine that keeps every shard in step with the directory.
//!
//! # Modules
//!
//! - [`engine`] - Shard set, event dispatch, reentrant reading, cleanup
//! - [`builtin`] - Membership shards wired in by default
//! - [`config`] - Engine configuration
//! - [`metrics`] - Event and maintenance counters

pub mod builtin;
pub mod config;
pub mod engine;
pub mod metrics;

pub use config::CacheConfig;
pub use engine::{CacheEngine, CleanupReport, ShardQuery};
pub use metrics::{CacheMetrics, MetricsSnapshot};
