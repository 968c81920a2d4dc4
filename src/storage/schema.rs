//! Database schema definitions and migrations.

use duckdb::Connection;

use crate::storage::StorageError;

/// SQL statement for creating the messages table.
///
/// `id` is assigned from a sequence so it strictly increases in write order.
/// Timestamps are stored as microseconds since the Unix epoch. The payload is
/// stored as a JSON string for prepared statement compatibility. `machine_id`
/// and `status` are write-time-derived from the payload so filtered reads
/// never have to parse JSON.
pub const MESSAGES_TABLE_DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS messages_id_seq;
CREATE TABLE IF NOT EXISTS messages (
    id          BIGINT PRIMARY KEY DEFAULT NEXTVAL('messages_id_seq'),
    ts          BIGINT NOT NULL,
    topic       VARCHAR NOT NULL,
    payload     VARCHAR NOT NULL DEFAULT '{}',
    qos         INTEGER NOT NULL DEFAULT 0,
    machine_id  VARCHAR,
    status      VARCHAR,
    received_at BIGINT NOT NULL
);
"#;

/// SQL statements for the secondary indexes.
///
/// (topic, ts) serves last-value lookups, (machine_id, ts) serves filtered
/// queries, (received_at) serves the retention sweep.
pub const MESSAGES_INDEX_DDL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_topic_ts ON messages (topic, ts);
CREATE INDEX IF NOT EXISTS idx_messages_machine_ts ON messages (machine_id, ts);
CREATE INDEX IF NOT EXISTS idx_messages_received_at ON messages (received_at);
"#;

/// Initialize the database schema.
///
/// Creates the table, sequence, and indexes if they don't exist.
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(MESSAGES_TABLE_DDL)?;
    conn.execute_batch(MESSAGES_INDEX_DDL)?;

    tracing::info!("Database schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initialization() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = 'messages'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn test_id_assigned_from_sequence_in_write_order() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO messages (ts, topic, payload, received_at) VALUES (1000, 'a/b', '{}', 1000)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO messages (ts, topic, payload, received_at) VALUES (500, 'a/b', '{}', 2000)",
            [],
        )
        .unwrap();

        let ids: Vec<i64> = conn
            .prepare("SELECT id FROM messages ORDER BY received_at")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1], "ids must increase in write order");
    }
}
