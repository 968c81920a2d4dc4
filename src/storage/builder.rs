//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::state::ServiceState;
use crate::storage::StorageError;
use crate::storage::actor::{DEFAULT_BATCH_FLUSH_INTERVAL, DEFAULT_BATCH_SIZE, DbActor};
use crate::storage::pool::ReadPool;
use crate::storage::{MessageReader, StorageAdmin, StorageWriter};

/// Default channel capacity for writer commands.
///
/// With batch flushing every 500 items or 1 second, this capacity supports
/// roughly 20 seconds of buffering at 500 messages/sec before the drop
/// policy engages.
const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Minimum connection pool size.
const MIN_POOL_SIZE: u32 = 2;

/// Maximum connection pool size.
const MAX_POOL_SIZE: u32 = 32;

/// Calculate default pool size based on available CPU parallelism.
///
/// Returns the number of available CPUs, clamped between MIN_POOL_SIZE and MAX_POOL_SIZE.
fn default_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map(|p| (p.get() as u32).clamp(MIN_POOL_SIZE, MAX_POOL_SIZE))
        .unwrap_or(4)
}

/// Default WAL checkpoint interval.
const DEFAULT_CHECKPOINT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    db_path: PathBuf,
    pool_size: u32,
    channel_capacity: usize,
    checkpoint_interval: std::time::Duration,
    batch_size: usize,
    batch_flush_interval: std::time::Duration,
    state: Option<Arc<ServiceState>>,
}

impl StorageBuilder {
    /// Create a new storage builder.
    ///
    /// Pool size defaults to the number of available CPUs (clamped to 2-32).
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            pool_size: default_pool_size(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_flush_interval: DEFAULT_BATCH_FLUSH_INTERVAL,
            state: None,
        }
    }

    /// Set the connection pool size for readers.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the channel capacity for writer commands (the ingestion queue bound).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the WAL checkpoint interval.
    pub fn checkpoint_interval(mut self, interval: std::time::Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the batch size for message buffering.
    ///
    /// The actor will flush buffered messages when this threshold is reached.
    /// Default: 500 items.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the batch flush interval for message buffering.
    ///
    /// The actor will flush buffered messages after this duration, even if
    /// the batch size threshold hasn't been reached. Default: 1 second.
    pub fn batch_flush_interval(mut self, interval: std::time::Duration) -> Self {
        self.batch_flush_interval = interval;
        self
    }

    /// Share a service state object for drop/failure counters.
    ///
    /// A private one is created when not provided (useful in tests).
    pub fn state(mut self, state: Arc<ServiceState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Build the storage layer and return handles.
    pub fn build(self) -> Result<StorageHandles, StorageError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = self.db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let state = self
            .state
            .unwrap_or_else(|| Arc::new(ServiceState::new()));

        // Spawn writer actor; it owns the write connection and the schema init.
        let (actor_handle, tx, reader_conn) = DbActor::spawn(
            &self.db_path,
            self.channel_capacity,
            self.checkpoint_interval,
            self.batch_size,
            self.batch_flush_interval,
            Arc::clone(&state),
        )?;

        // Readers are cloned from the writer's connection so they share its
        // database instance and see writes without checkpoint delays.
        let pool = ReadPool::new(reader_conn, self.pool_size)?;

        Ok(StorageHandles {
            writer: StorageWriter::new(tx.clone(), state),
            reader: MessageReader::new(pool),
            admin: StorageAdmin::new(tx),
            actor_handle: Some(actor_handle),
        })
    }
}

/// Handles to all storage layer facades.
pub struct StorageHandles {
    /// Non-blocking writer facade over the ingestion queue.
    pub writer: StorageWriter,
    /// Facade for reading messages.
    pub reader: MessageReader,
    /// Facade for storage administration.
    pub admin: StorageAdmin,
    /// Internal actor handle for graceful shutdown.
    actor_handle: Option<JoinHandle<()>>,
}

impl StorageHandles {
    /// Gracefully shutdown the storage layer.
    ///
    /// Sends shutdown command to the writer actor and waits for it to finish.
    pub fn shutdown(mut self) -> Result<(), StorageError> {
        self.admin.shutdown()?;

        if let Some(handle) = self.actor_handle.take() {
            handle
                .join()
                .map_err(|_| StorageError::Internal("Failed to join actor thread".to_string()))?;
        }

        Ok(())
    }
}

impl Drop for StorageHandles {
    fn drop(&mut self) {
        // Try graceful shutdown if not already done
        if self.actor_handle.is_some() {
            let _ = self.admin.shutdown();
            if let Some(handle) = self.actor_handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{MessageDraft, MessageQuery};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    fn draft(topic: &str) -> MessageDraft {
        MessageDraft {
            timestamp: Utc::now(),
            topic: topic.to_string(),
            payload: json!({"status": "idle"}),
            qos: 0,
            machine_id: None,
            status: Some("idle".to_string()),
        }
    }

    #[test]
    fn test_storage_roundtrip() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("roundtrip.db");

        let handles = StorageBuilder::new(&db_path)
            .pool_size(2)
            .channel_capacity(100)
            .build()
            .unwrap();

        for i in 0..5 {
            handles
                .writer
                .insert_message(draft(&format!("line/{i}")))
                .unwrap();
        }

        // Shut the actor down first so the flush is deterministic.
        let reader = handles.reader.clone();
        handles.shutdown().unwrap();

        let results = reader
            .query(MessageQuery {
                topic: None,
                machine_id: None,
                limit: 10,
            })
            .unwrap();
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn test_builder_shares_state() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("state.db");
        let state = Arc::new(ServiceState::new());

        let handles = StorageBuilder::new(&db_path)
            .pool_size(2)
            .channel_capacity(100)
            .state(Arc::clone(&state))
            .build()
            .unwrap();

        handles.writer.insert_message(draft("a/b")).unwrap();
        assert_eq!(state.dropped_messages(), 0);

        handles.shutdown().unwrap();
    }

    #[test]
    fn test_default_pool_size_within_bounds() {
        let size = super::default_pool_size();
        assert!(size >= super::MIN_POOL_SIZE);
        assert!(size <= super::MAX_POOL_SIZE);
    }
}
