//! Message Bus Layer
//!
//! Owns the single live connection to the message bus. A dedicated task
//! blocks on the client receive loop and forwards sanitized drafts onto the
//! bounded ingestion queue, reconnecting forever with capped exponential
//! backoff.
//!
//! # Components
//!
//! - [`BusSubscriber`]: Connection, subscription, and receive loop
//! - [`CredentialFile`]: Rotating bearer credential mounted by the platform

mod credentials;
mod subscriber;

pub use credentials::{CredentialError, CredentialFile};
pub use subscriber::{BusError, BusSubscriber, SubscriberContext};
