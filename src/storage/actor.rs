//! Writer actor with dedicated connection and MPSC channel.
//!
//! Single-writer pattern: one thread owns the write connection, processes
//! commands via a bounded MPSC channel. Implements batch buffering: flushes
//! when the buffer reaches the batch size or the flush interval elapses.

use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use duckdb::Connection;

use crate::state::ServiceState;
use crate::storage::StorageError;
use crate::storage::schema::init_schema;
use crate::storage::types::MessageDraft;

// =============================================================================
// Constants
// =============================================================================

/// Default maximum items in buffer before flush.
pub(crate) const DEFAULT_BATCH_SIZE: usize = 500;

/// Default maximum time before buffer flush.
pub(crate) const DEFAULT_BATCH_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period for draining the queue on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Attempts per record when the batch transaction fails.
const WRITE_RETRY_ATTEMPTS: usize = 2;

const INSERT_SQL: &str = "INSERT INTO messages (ts, topic, payload, qos, machine_id, status, received_at)
     VALUES (?, ?, ?, ?, ?, ?, ?)";

// =============================================================================
// Commands
// =============================================================================

/// Commands sent to the writer actor.
#[derive(Debug)]
pub enum Command {
    /// Persist a sanitized message (batch insert).
    InsertMessage(MessageDraft),
    /// Delete records with `received_at` older than the cutoff, in bounded batches.
    Purge { cutoff_micros: i64, batch_size: usize },
    /// Force flush all buffered data.
    Flush,
    /// Force WAL checkpoint.
    Checkpoint,
    /// Graceful shutdown.
    Shutdown,
}

/// A drained draft with its write time assigned.
struct PendingMessage {
    draft: MessageDraft,
    received_at: DateTime<Utc>,
}

// =============================================================================
// Buffer
// =============================================================================

/// Buffer for batch inserts with time-based and size-based flushing.
struct BatchBuffer {
    items: Vec<PendingMessage>,
    last_flush: Instant,
    batch_size: usize,
    flush_interval: Duration,
}

impl BatchBuffer {
    fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            items: Vec::with_capacity(batch_size),
            last_flush: Instant::now(),
            batch_size,
            flush_interval,
        }
    }

    fn push(&mut self, item: PendingMessage) {
        // Reset flush timer on first item to avoid treating long-idle buffers as overdue
        if self.items.is_empty() {
            self.last_flush = Instant::now();
        }
        self.items.push(item);
    }

    fn should_flush(&self) -> bool {
        self.items.len() >= self.batch_size
            || (!self.items.is_empty() && self.last_flush.elapsed() >= self.flush_interval)
    }

    fn take(&mut self) -> Vec<PendingMessage> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.items)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Database writer actor with batch buffering for inbound messages.
///
/// Assigns `received_at` as each draft is drained from the channel; `id`
/// comes from the store sequence at insert time. A failed batch falls back
/// to per-record inserts with retry so one bad row never loses the batch.
pub struct DbActor {
    conn: Connection,
    rx: Receiver<Command>,
    buffer: BatchBuffer,
    state: Arc<ServiceState>,
    last_checkpoint: Instant,
    checkpoint_interval: Duration,
}

impl DbActor {
    /// Spawn the writer actor thread.
    ///
    /// Returns a handle to the actor thread, the command sender that forms
    /// the ingestion queue, and a cloneable connection readers are cloned
    /// from. Clones share the writer's database instance, so reads see
    /// committed writes without waiting for a WAL checkpoint.
    pub fn spawn(
        db_path: &Path,
        channel_capacity: usize,
        checkpoint_interval: Duration,
        batch_size: usize,
        batch_flush_interval: Duration,
        state: Arc<ServiceState>,
    ) -> Result<(JoinHandle<()>, SyncSender<Command>, Connection), StorageError> {
        let (tx, rx) = mpsc::sync_channel(channel_capacity);
        let conn = Connection::open(db_path)?;
        init_schema(&conn)?;

        let reader_conn = conn.try_clone()?;

        let mut actor = DbActor {
            conn,
            rx,
            buffer: BatchBuffer::new(batch_size, batch_flush_interval),
            state,
            last_checkpoint: Instant::now(),
            checkpoint_interval,
        };
        let handle = thread::spawn(move || actor.run());

        Ok((handle, tx, reader_conn))
    }

    fn run(&mut self) {
        tracing::info!("DbActor started");

        loop {
            let now = Instant::now();
            let flush_deadline = if !self.buffer.is_empty() {
                self.buffer.last_flush + self.buffer.flush_interval
            } else {
                now + Duration::from_secs(60)
            };
            let checkpoint_deadline = self.last_checkpoint + self.checkpoint_interval;

            let deadline = std::cmp::min(flush_deadline, checkpoint_deadline);
            let timeout = deadline.saturating_duration_since(now);

            match self.rx.recv_timeout(timeout) {
                Ok(cmd) => {
                    if self.handle_command(cmd) {
                        break; // Shutdown requested
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Timeout: flush or checkpoint overdue
                }
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Channel disconnected, shutting down");
                    self.flush_buffer();
                    break;
                }
            }

            if self.buffer.should_flush() {
                self.flush_buffer();
            }

            if self.last_checkpoint.elapsed() >= self.checkpoint_interval {
                self.flush_buffer(); // Ensure everything is written before checkpoint
                if let Err(e) = self.checkpoint() {
                    tracing::error!(error = %e, "Periodic checkpoint failed");
                }
                self.last_checkpoint = Instant::now();
            }
        }

        tracing::info!("DbActor stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::InsertMessage(draft) => {
                self.buffer.push(PendingMessage {
                    draft,
                    received_at: Utc::now(),
                });
            }
            Command::Purge {
                cutoff_micros,
                batch_size,
            } => match self.purge(cutoff_micros, batch_size) {
                Ok(deleted) => {
                    tracing::info!(deleted, "Retention sweep completed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Retention sweep failed");
                    self.state.record_storage_fault();
                }
            },
            Command::Flush => {
                self.flush_buffer();
            }
            Command::Checkpoint => {
                self.flush_buffer();
                if let Err(e) = self.checkpoint() {
                    tracing::error!(error = %e, "Checkpoint failed");
                }
            }
            Command::Shutdown => {
                tracing::info!("DbActor shutting down");
                self.drain_remaining();
                self.flush_buffer();
                let _ = self.checkpoint();
                return true;
            }
        }
        false
    }

    /// Drain whatever is still queued, bounded by the shutdown grace period.
    fn drain_remaining(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            match self.rx.try_recv() {
                Ok(Command::InsertMessage(draft)) => {
                    self.buffer.push(PendingMessage {
                        draft,
                        received_at: Utc::now(),
                    });
                    if self.buffer.len() >= self.buffer.batch_size {
                        self.flush_buffer();
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    // =========================================================================
    // Insert Operations
    // =========================================================================

    fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let pending = self.buffer.take();

        // Encode payloads up front so an unserializable record is dropped and
        // counted exactly once, whichever insert path runs.
        let mut rows = Vec::with_capacity(pending.len());
        for item in pending {
            match serde_json::to_string(&item.draft.payload) {
                Ok(payload_json) => rows.push((item, payload_json)),
                Err(e) => {
                    tracing::warn!(error = %e, topic = %item.draft.topic,
                        "Unserializable payload, dropping message");
                    self.state.record_malformed();
                }
            }
        }
        if rows.is_empty() {
            return;
        }

        match self.insert_rows_tx(&rows) {
            Ok(()) => {
                tracing::debug!(count = rows.len(), "Messages batch inserted");
            }
            Err(e) => {
                tracing::warn!(error = %e, count = rows.len(),
                    "Batch insert failed, retrying per record");
                for row in &rows {
                    self.insert_with_retry(row);
                }
            }
        }
    }

    /// Insert a batch of encoded rows in one transaction.
    fn insert_rows_tx(&mut self, rows: &[(PendingMessage, String)]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_SQL)?;
            for (item, payload_json) in rows {
                stmt.execute(duckdb::params![
                    item.draft.timestamp.timestamp_micros(),
                    &item.draft.topic,
                    payload_json,
                    i32::from(item.draft.qos),
                    item.draft.machine_id.as_deref(),
                    item.draft.status.as_deref(),
                    item.received_at.timestamp_micros(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Fallback path: insert one row, retrying once before dropping it.
    fn insert_with_retry(&self, row: &(PendingMessage, String)) {
        let (item, payload_json) = row;
        for attempt in 1..=WRITE_RETRY_ATTEMPTS {
            match self.insert_row(item, payload_json) {
                Ok(()) => return,
                Err(e) if attempt < WRITE_RETRY_ATTEMPTS => {
                    tracing::warn!(error = %e, topic = %item.draft.topic,
                        "Message insert failed, retrying");
                }
                Err(e) => {
                    tracing::error!(error = %e, topic = %item.draft.topic,
                        "Message insert failed, dropping record");
                    self.state.record_storage_fault();
                }
            }
        }
    }

    fn insert_row(&self, item: &PendingMessage, payload_json: &str) -> Result<(), StorageError> {
        let mut stmt = self.conn.prepare_cached(INSERT_SQL)?;
        stmt.execute(duckdb::params![
            item.draft.timestamp.timestamp_micros(),
            &item.draft.topic,
            payload_json,
            i32::from(item.draft.qos),
            item.draft.machine_id.as_deref(),
            item.draft.status.as_deref(),
            item.received_at.timestamp_micros(),
        ])?;
        Ok(())
    }

    // =========================================================================
    // Maintenance Operations
    // =========================================================================

    /// Delete purge-eligible records in bounded batches.
    ///
    /// Each round deletes at most `batch_size` rows so the sweep never holds
    /// the table for its full duration. Repeated runs with no new data are
    /// no-ops.
    fn purge(&self, cutoff_micros: i64, batch_size: usize) -> Result<usize, StorageError> {
        let sql = format!(
            "DELETE FROM messages WHERE id IN
                 (SELECT id FROM messages WHERE received_at < ? LIMIT {batch_size})"
        );
        let mut total = 0;
        loop {
            let deleted = self.conn.execute(&sql, duckdb::params![cutoff_micros])?;
            total += deleted;
            if deleted < batch_size {
                break;
            }
        }
        Ok(total)
    }

    fn checkpoint(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("CHECKPOINT;")?;
        tracing::debug!("WAL checkpoint completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn draft(topic: &str, machine_id: Option<&str>) -> MessageDraft {
        MessageDraft {
            timestamp: Utc::now(),
            topic: topic.to_string(),
            payload: json!({"machine_id": machine_id, "status": "running"}),
            qos: 0,
            machine_id: machine_id.map(str::to_string),
            status: Some("running".to_string()),
        }
    }

    fn spawn_actor(
        db_path: &Path,
    ) -> (
        JoinHandle<()>,
        SyncSender<Command>,
        Arc<ServiceState>,
        Connection,
    ) {
        let state = Arc::new(ServiceState::new());
        let (handle, tx, reader_conn) = DbActor::spawn(
            db_path,
            100,
            Duration::from_secs(1),
            DEFAULT_BATCH_SIZE,
            DEFAULT_BATCH_FLUSH_INTERVAL,
            Arc::clone(&state),
        )
        .unwrap();
        (handle, tx, state, reader_conn)
    }

    fn count_messages(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_actor_lifecycle() {
        let dir = tempdir().unwrap();
        let (handle, tx, _state, _conn) = spawn_actor(&dir.path().join("test.db"));
        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_insert_message_with_flush() {
        let dir = tempdir().unwrap();
        let (handle, tx, state, conn) = spawn_actor(&dir.path().join("insert.db"));

        tx.send(Command::InsertMessage(draft("factory/cnc", Some("CNC-01"))))
            .unwrap();
        tx.send(Command::Flush).unwrap();
        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();

        assert_eq!(count_messages(&conn), 1);
        assert_eq!(state.storage_faults(), 0);

        let (machine_id, status): (String, String) = conn
            .query_row("SELECT machine_id, status FROM messages", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(machine_id, "CNC-01");
        assert_eq!(status, "running");
    }

    #[test]
    fn test_batch_threshold() {
        let dir = tempdir().unwrap();
        let state = Arc::new(ServiceState::new());
        let (handle, tx, conn) = DbActor::spawn(
            &dir.path().join("batch.db"),
            1000,
            Duration::from_secs(5),
            50,
            Duration::from_secs(5),
            state,
        )
        .unwrap();

        for i in 0..50 {
            tx.send(Command::InsertMessage(draft(
                &format!("line/{i}"),
                None,
            )))
            .unwrap();
        }

        // Wait for auto-flush (buffer should be full)
        std::thread::sleep(Duration::from_millis(200));
        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();

        assert_eq!(count_messages(&conn), 50);
    }

    #[test]
    fn test_time_based_flush() {
        let dir = tempdir().unwrap();
        let state = Arc::new(ServiceState::new());
        let (handle, tx, conn) = DbActor::spawn(
            &dir.path().join("time_flush.db"),
            100,
            Duration::from_secs(10),
            DEFAULT_BATCH_SIZE,
            Duration::from_millis(200),
            state,
        )
        .unwrap();

        tx.send(Command::InsertMessage(draft("factory/cnc", None)))
            .unwrap();

        // Wait for time-based flush
        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(
            count_messages(&conn),
            1,
            "Time-based flush should have written the message"
        );

        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_purge_removes_aged_records_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let (handle, tx, state, conn) = spawn_actor(&dir.path().join("purge.db"));

        for _ in 0..3 {
            tx.send(Command::InsertMessage(draft("factory/cnc", Some("CNC-01"))))
                .unwrap();
        }
        tx.send(Command::Flush).unwrap();

        // Cutoff in the future: everything currently stored is purge-eligible.
        let cutoff = (Utc::now() + chrono::Duration::hours(1)).timestamp_micros();
        tx.send(Command::Purge {
            cutoff_micros: cutoff,
            batch_size: 2,
        })
        .unwrap();
        // Second sweep with no intervening writes must be a no-op.
        tx.send(Command::Purge {
            cutoff_micros: cutoff,
            batch_size: 2,
        })
        .unwrap();
        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();

        assert_eq!(count_messages(&conn), 0);
        assert_eq!(state.storage_faults(), 0);
    }

    #[test]
    fn test_purge_spares_recent_records() {
        let dir = tempdir().unwrap();
        let (handle, tx, _state, conn) = spawn_actor(&dir.path().join("purge_recent.db"));

        tx.send(Command::InsertMessage(draft("factory/cnc", None)))
            .unwrap();
        tx.send(Command::Flush).unwrap();

        // Cutoff in the past: nothing qualifies.
        let cutoff = (Utc::now() - chrono::Duration::hours(24)).timestamp_micros();
        tx.send(Command::Purge {
            cutoff_micros: cutoff,
            batch_size: 100,
        })
        .unwrap();
        tx.send(Command::Shutdown).unwrap();
        handle.join().unwrap();

        assert_eq!(count_messages(&conn), 1);
    }
}
