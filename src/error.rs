//! Error types for the directory attribute cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the directory attribute cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistent store error (open, read, write or commit of an LMDB transaction)
    #[error("Store error: {0}")]
    Store(#[from] heed::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A directory filter could not be parsed
    #[error("Invalid filter '{filter}' at offset {offset}: {reason}")]
    InvalidFilter {
        filter: String,
        offset: usize,
        reason: String,
    },

    /// A shard definition is missing a field or carries an unusable value
    #[error("Invalid shard definition: {0}")]
    InvalidDefinition(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// No active shard carries the requested name
    #[error("Shard not found: {0}")]
    UnknownShard(String),

    /// At least one shard failed to apply a directory change
    #[error("Failed to update shards {shards:?} for {dn}")]
    DispatchFailed { dn: String, shards: Vec<String> },

    /// At least one shard could not be cleaned up
    #[error("Failed to clean up shards {shards:?}")]
    CleanupFailed { shards: Vec<String> },

    // =========================================================================
    // Ingestion Errors
    // =========================================================================
    /// A change event in a replayed stream could not be decoded
    #[error("Malformed change event on line {line}: {reason}")]
    MalformedEvent { line: usize, reason: String },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    /// Metrics registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
