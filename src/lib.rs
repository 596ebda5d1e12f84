//! dircache - Directory Attribute Cache
//!
//! Keeps derived, persistent key/value indices ("shards") of directory
//! entries up to date from a stream of directory change notifications, and
//! answers membership queries from them without touching the directory.
//!
//! # Architecture
//!
//! ```text
//! change listener ──▶ ChangeHandler ──▶ CacheEngine ──▶ Shard ... Shard
//!                                           │              (LMDB named dbs)
//!                       ShardRegistry ──────┘                   ▲
//!                       (shards.json)          membership ──────┘
//!                                              (groups_for_user, users_in_group)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Engine, built-in shards, configuration, metrics
//! - [`directory`] - Directory objects, filters, DN heuristics
//! - [`error`] - Error types
//! - [`ingest`] - Change handler contract and JSON-lines replay
//! - [`membership`] - Group membership resolution
//! - [`registry`] - Persistent custom shard definitions
//! - [`shard`] - Shard definitions, indices and storage

pub mod cache;
pub mod directory;
pub mod error;
pub mod ingest;
pub mod membership;
pub mod registry;
pub mod shard;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheEngine, CleanupReport};
pub use directory::{Attributes, DirectoryObject, Filter};
pub use error::{Error, Result};
pub use ingest::{replay, ChangeEvent, ChangeHandler};
pub use membership::{groups_for_user, users_in_group};
pub use registry::ShardRegistry;
pub use shard::{Reader, Shard, ShardDefinition};
