//! Chronik - Edge Telemetry Historian
//!
//! This crate provides the core functionality for the Chronik edge
//! historian. It can be used as a library by other Rust projects, or run as
//! a standalone binary with the `chronik` executable.
//!
//! # Architecture
//!
//! - **Bus**: Single live subscription to the message bus with reconnect backoff
//! - **Sanitizer**: Payload scrubbing and derived-field extraction
//! - **Storage**: DuckDB-based persistence behind a bounded ingestion queue
//! - **Sweeper**: Timer-driven retention purge
//! - **Server**: REST query API (health, last-value, query, stats)
//!
//! # Example
//!
//! ```rust,no_run
//! use chronik::{ServiceState, StorageBuilder};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let state = Arc::new(ServiceState::new());
//! let handles = StorageBuilder::new("/tmp/chronik.db")
//!     .state(Arc::clone(&state))
//!     .build()?;
//!
//! // handles.writer feeds the store; handles.reader answers queries.
//! handles.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod sanitize;
pub mod server;
pub mod state;
pub mod storage;
pub mod sweeper;

pub use bus::{BusError, BusSubscriber, CredentialFile};
pub use config::{AppConfig, ConfigError};
pub use sanitize::RawEnvelope;
pub use state::ServiceState;
pub use storage::{
    MessageDraft, MessageQuery, MessageRecord, MessageReader, StorageAdmin, StorageBuilder,
    StorageError, StorageHandles, StorageWriter, StoreStats,
};
pub use sweeper::RetentionSweeper;
