//! Core data types for the storage layer.
//!
//! This module defines the primary data structures used throughout the
//! storage layer:
//!
//! - [`MessageDraft`]: A sanitized message awaiting persistence
//! - [`MessageRecord`]: A durably stored message row
//! - [`MessageQuery`]: Filter parameters for range queries
//! - [`StoreStats`]: Aggregate statistics over the message table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A sanitized message that has not yet been persisted.
///
/// Produced by the sanitizer from a raw bus envelope. The storage writer
/// assigns `id` and `received_at` when it drains the draft from the
/// ingestion queue, turning it into a [`MessageRecord`].
///
/// # Example
///
/// ```
/// use chronik::MessageDraft;
/// use chrono::Utc;
/// use serde_json::json;
///
/// let draft = MessageDraft {
///     timestamp: Utc::now(),
///     topic: "factory/cnc".to_string(),
///     payload: json!({"machine_id": "CNC-01", "status": "running"}),
///     qos: 1,
///     machine_id: Some("CNC-01".to_string()),
///     status: Some("running".to_string()),
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Event time parsed from the payload, or receipt time as fallback (UTC).
    pub timestamp: DateTime<Utc>,
    /// Bus topic the message arrived on.
    pub topic: String,
    /// Sanitized structured payload.
    pub payload: Value,
    /// Delivery-quality hint from the bus, informational only.
    pub qos: u8,
    /// Shallow-extracted machine identifier, if the payload carried one.
    pub machine_id: Option<String>,
    /// Shallow-extracted status, if the payload carried one.
    pub status: Option<String>,
}

/// A message row stored in the `messages` table.
///
/// Records are immutable once written and only removed by the retention
/// sweeper. `id` strictly increases in write order; `received_at` is the
/// authoritative age for retention, tolerating event-time clock skew in
/// `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Store-assigned identifier, monotonically increasing.
    pub id: i64,
    /// Event time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Bus topic the message arrived on.
    pub topic: String,
    /// Sanitized structured payload.
    pub payload: Value,
    /// Delivery-quality hint from the bus.
    pub qos: u8,
    /// Derived machine identifier, indexed for filtered queries.
    pub machine_id: Option<String>,
    /// Derived status.
    pub status: Option<String>,
    /// Wall-clock write time (UTC), authoritative for retention.
    pub received_at: DateTime<Utc>,
}

/// Filter parameters for a range query over stored messages.
///
/// Results are always ordered by recency descending. The limit is validated
/// by the caller against the configured default/maximum before it gets here.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub topic: Option<String>,
    pub machine_id: Option<String>,
    pub limit: u32,
}

/// Aggregate statistics over the message table.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Total stored records.
    pub total_messages: i64,
    /// Count of distinct topics seen in the stored window.
    pub unique_topics: i64,
    /// Event time of the oldest stored record.
    pub oldest_message: Option<DateTime<Utc>>,
    /// Event time of the newest stored record.
    pub newest_message: Option<DateTime<Utc>>,
    /// Estimated on-disk size of the store in bytes.
    pub database_size_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_serializes_rfc3339_timestamps() {
        let record = MessageRecord {
            id: 7,
            timestamp: DateTime::parse_from_rfc3339("2026-01-12T10:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            topic: "factory/cnc".to_string(),
            payload: json!({"status": "running"}),
            qos: 1,
            machine_id: Some("CNC-01".to_string()),
            status: Some("running".to_string()),
            received_at: DateTime::parse_from_rfc3339("2026-01-12T10:30:01Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["topic"], "factory/cnc");
        assert_eq!(value["timestamp"], "2026-01-12T10:30:00Z");
        assert_eq!(value["payload"]["status"], "running");
        assert_eq!(value["machine_id"], "CNC-01");
    }

    #[test]
    fn test_draft_roundtrip() {
        let draft = MessageDraft {
            timestamp: Utc::now(),
            topic: "plant/press".to_string(),
            payload: json!({"machine_id": "PRESS-02"}),
            qos: 0,
            machine_id: Some("PRESS-02".to_string()),
            status: None,
        };

        let encoded = serde_json::to_string(&draft).unwrap();
        let decoded: MessageDraft = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.topic, draft.topic);
        assert_eq!(decoded.machine_id, draft.machine_id);
        assert_eq!(decoded.status, None);
    }
}
