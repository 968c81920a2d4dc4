//! Shared service state: liveness flags and drop/failure counters.
//!
//! One explicitly-owned instance is constructed at startup and handed to
//! each component, so every drop and failure is observable through
//! `/health` and `/api/v1/stats` and components stay independently
//! testable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters and flags shared between the bus subscriber, storage writer,
/// retention sweeper, and query service.
///
/// All counters are monotonic; readers use relaxed loads since the values
/// are diagnostic, not coordination.
#[derive(Debug, Default)]
pub struct ServiceState {
    bus_connected: AtomicBool,
    dropped_messages: AtomicU64,
    malformed_messages: AtomicU64,
    storage_faults: AtomicU64,
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the bus subscriber currently holds a live connection.
    pub fn bus_connected(&self) -> bool {
        self.bus_connected.load(Ordering::Relaxed)
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.bus_connected.store(connected, Ordering::Relaxed);
    }

    /// Count a message discarded because the ingestion queue was full.
    pub fn record_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Count a message the store could not serialize.
    pub fn record_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_messages(&self) -> u64 {
        self.malformed_messages.load(Ordering::Relaxed)
    }

    /// Count a record lost to a write/delete failure after retry.
    pub fn record_storage_fault(&self) {
        self.storage_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_faults(&self) -> u64 {
        self.storage_faults.load(Ordering::Relaxed)
    }

    /// Sum of all drop and failure counters, surfaced as `errors_count`.
    pub fn errors_total(&self) -> u64 {
        self.dropped_messages() + self.malformed_messages() + self.storage_faults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let state = ServiceState::new();
        assert!(!state.bus_connected());
        assert_eq!(state.dropped_messages(), 0);
        assert_eq!(state.malformed_messages(), 0);
        assert_eq!(state.storage_faults(), 0);
        assert_eq!(state.errors_total(), 0);
    }

    #[test]
    fn test_errors_total_sums_all_counters() {
        let state = ServiceState::new();
        state.record_dropped();
        state.record_dropped();
        state.record_malformed();
        state.record_storage_fault();
        assert_eq!(state.dropped_messages(), 2);
        assert_eq!(state.errors_total(), 4);
    }

    #[test]
    fn test_bus_connected_flag() {
        let state = ServiceState::new();
        state.set_bus_connected(true);
        assert!(state.bus_connected());
        state.set_bus_connected(false);
        assert!(!state.bus_connected());
    }
}
