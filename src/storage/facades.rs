//! User-facing storage facades.
//!
//! Provides ergonomic APIs for storage operations:
//! - `StorageWriter`: Non-blocking writes via MPSC
//! - `MessageReader`: Last-value, filtered query, and stats reads
//! - `StorageAdmin`: Retention sweeps and maintenance

use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::state::ServiceState;
use crate::storage::StorageError;
use crate::storage::actor::Command;
use crate::storage::pool::ReadPool;
use crate::storage::types::{MessageDraft, MessageQuery, MessageRecord, StoreStats};

const SELECT_COLUMNS: &str =
    "id, ts, topic, payload, qos, machine_id, status, received_at";

// =============================================================================
// Writer
// =============================================================================

/// Non-blocking storage writer over the bounded ingestion queue.
///
/// Message inserts use `try_send`: when the queue is full the message is
/// dropped and the shared dropped-messages counter incremented, so the bus
/// delivery path never blocks on storage I/O. Control commands (flush,
/// shutdown) use a blocking send since they are low volume and must arrive.
#[derive(Clone)]
pub struct StorageWriter {
    tx: SyncSender<Command>,
    state: Arc<ServiceState>,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter").finish_non_exhaustive()
    }
}

impl StorageWriter {
    pub(crate) fn new(tx: SyncSender<Command>, state: Arc<ServiceState>) -> Self {
        Self { tx, state }
    }

    /// Enqueue a message for persistence. Never blocks.
    ///
    /// Returns [`StorageError::QueueFull`] when the bounded queue is at
    /// capacity; the drop has already been counted by then.
    pub fn insert_message(&self, draft: MessageDraft) -> Result<(), StorageError> {
        match self.tx.try_send(Command::InsertMessage(draft)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Ingestion queue full, dropping message");
                self.state.record_dropped();
                Err(StorageError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(StorageError::ChannelSend),
        }
    }

    /// Force flush all buffered data.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.tx
            .send(Command::Flush)
            .map_err(|_| StorageError::ChannelSend)
    }

    /// Writer over a channel nobody drains, so overflow is deterministic.
    /// The receiver is leaked to keep the channel open.
    #[cfg(test)]
    pub(crate) fn stalled(capacity: usize, state: Arc<ServiceState>) -> Self {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
        std::mem::forget(rx);
        Self::new(tx, state)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Reader over the message table. All methods are independent snapshots on
/// pooled connections.
#[derive(Clone)]
pub struct MessageReader {
    pool: Arc<ReadPool>,
}

impl std::fmt::Debug for MessageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReader").finish_non_exhaustive()
    }
}

impl MessageReader {
    pub(crate) fn new(pool: Arc<ReadPool>) -> Self {
        Self { pool }
    }

    /// The single most recent record for a topic, or `None`.
    pub fn last_value(&self, topic: &str) -> Result<Option<MessageRecord>, StorageError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM messages WHERE topic = ? ORDER BY ts DESC, id DESC LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map([topic], row_to_record)?;

        rows.next().transpose().map_err(StorageError::from)
    }

    /// Filtered query, recency descending, bounded by `q.limit`.
    pub fn query(&self, q: MessageQuery) -> Result<Vec<MessageRecord>, StorageError> {
        let conn = self.pool.get()?;

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM messages WHERE 1 = 1");
        let mut params: Vec<Box<dyn duckdb::ToSql>> = Vec::new();

        if let Some(ref topic) = q.topic {
            sql.push_str(" AND topic = ?");
            params.push(Box::new(topic.clone()));
        }
        if let Some(ref machine_id) = q.machine_id {
            sql.push_str(" AND machine_id = ?");
            params.push(Box::new(machine_id.clone()));
        }
        sql.push_str(&format!(" ORDER BY ts DESC, id DESC LIMIT {}", q.limit));

        let param_refs: Vec<&dyn duckdb::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), row_to_record)?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// Total stored record count.
    pub fn count(&self) -> Result<i64, StorageError> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(StorageError::from)
    }

    /// Aggregate statistics over the message table.
    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        let conn = self.pool.get()?;

        let (total, topics, oldest, newest) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT topic), MIN(ts), MAX(ts) FROM messages",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )?;

        let size_bytes: i64 = conn.query_row(
            "SELECT total_blocks * block_size FROM pragma_database_size()",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            total_messages: total,
            unique_topics: topics,
            oldest_message: oldest.map(micros_to_datetime),
            newest_message: newest.map(micros_to_datetime),
            database_size_bytes: size_bytes,
        })
    }
}

// =============================================================================
// Admin
// =============================================================================

/// Storage administration: retention sweeps and maintenance commands.
#[derive(Clone)]
pub struct StorageAdmin {
    tx: SyncSender<Command>,
}

impl std::fmt::Debug for StorageAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdmin").finish_non_exhaustive()
    }
}

impl StorageAdmin {
    pub(crate) fn new(tx: SyncSender<Command>) -> Self {
        Self { tx }
    }

    /// Request a purge of records older than the retention window.
    ///
    /// `try_send` keeps the sweeper tick non-blocking; a full queue means a
    /// backlog of writes is ahead of the sweep, and the next tick retries.
    pub fn sweep(&self, window: Duration, batch_size: usize) -> Result<(), StorageError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| StorageError::Internal(format!("retention window out of range: {e}")))?;
        let cutoff_micros = (Utc::now() - window).timestamp_micros();
        self.tx
            .try_send(Command::Purge {
                cutoff_micros,
                batch_size,
            })
            .map_err(|_| StorageError::ChannelSend)
    }

    /// Force flush all buffered data.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.tx
            .send(Command::Flush)
            .map_err(|_| StorageError::ChannelSend)
    }

    /// Force a WAL checkpoint.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        self.tx
            .send(Command::Checkpoint)
            .map_err(|_| StorageError::ChannelSend)
    }

    /// Request actor shutdown (drain, flush, checkpoint, exit).
    pub fn shutdown(&self) -> Result<(), StorageError> {
        self.tx
            .send(Command::Shutdown)
            .map_err(|_| StorageError::ChannelSend)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Map a result row in `SELECT_COLUMNS` order to a record.
fn row_to_record(row: &duckdb::Row<'_>) -> Result<MessageRecord, duckdb::Error> {
    let payload_raw: String = row.get(3)?;
    let payload = Value::from_str(&payload_raw).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "Stored payload is not valid JSON, wrapping as string");
        Value::String(payload_raw)
    });

    Ok(MessageRecord {
        id: row.get(0)?,
        timestamp: micros_to_datetime(row.get(1)?),
        topic: row.get(2)?,
        payload,
        qos: u8::try_from(row.get::<_, i32>(4)?).unwrap_or(0),
        machine_id: row.get(5)?,
        status: row.get(6)?,
        received_at: micros_to_datetime(row.get(7)?),
    })
}
