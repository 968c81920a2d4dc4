//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause (database, pool, channel, etc.).

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    /// Failed to check out a reader connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The bounded ingestion queue is full; the item was dropped and counted.
    #[error("ingestion queue full")]
    QueueFull,

    /// Failed to send a command to the writer actor (channel closed).
    #[error("failed to send command to writer actor")]
    ChannelSend,

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error (e.g., thread join failure).
    #[error("internal error: {0}")]
    Internal(String),
}
