//! Storage Layer
//!
//! Durable message history with read/write separation:
//! - **Writer**: Dedicated thread with exclusive writes, fed by a bounded MPSC channel
//! - **Reader**: Connection pool for concurrent reads
//!
//! # Components
//!
//! - [`StorageWriter`]: Non-blocking write facade over the ingestion queue
//! - [`MessageReader`]: Last-value, filtered query, and stats reads
//! - [`StorageAdmin`]: Retention sweeps and maintenance operations
//! - [`StorageBuilder`] / [`StorageHandles`]: Initialization and lifecycle management

mod actor;
mod builder;
mod error;
mod facades;
mod pool;
mod schema;
mod types;

pub use builder::{StorageBuilder, StorageHandles};
pub use error::StorageError;
pub use facades::{MessageReader, StorageAdmin, StorageWriter};
pub use types::{MessageDraft, MessageQuery, MessageRecord, StoreStats};
