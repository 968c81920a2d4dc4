//! Bus subscriber: the single live connection to the message bus.
//!
//! A dedicated task blocks on the consumer receive loop and forwards each
//! decoded envelope through the sanitizer onto the bounded ingestion queue,
//! so the concurrency stays visible instead of buried in client callbacks.
//! The receive path never blocks on storage I/O: enqueueing is `try_send`
//! and a full queue engages the counted drop policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rdkafka::ClientContext;
use rdkafka::client::OAuthToken;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::credentials::{CredentialError, CredentialFile};
use crate::config::{BusAuthMethod, BusConfig};
use crate::sanitize::{self, RawEnvelope};
use crate::state::ServiceState;
use crate::storage::{StorageError, StorageWriter};

/// Bus message header carrying the delivery-quality hint.
const QOS_HEADER: &str = "qos";

/// Validity window reported for a refreshed bearer token. The client
/// re-invokes the refresh callback before expiry, which re-reads the
/// mounted file and picks up rotations.
const TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// Errors that can occur in the bus subscriber.
#[derive(Debug, Error)]
pub enum BusError {
    /// Bus client operation failed.
    #[error("bus client error: {0}")]
    Kafka(#[from] KafkaError),

    /// Bearer credential could not be loaded.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Subscriber configuration error.
    #[error("bus config error: {0}")]
    Config(String),
}

/// Client context wiring the rotating credential file into the consumer's
/// OAUTHBEARER token refresh callback.
pub struct SubscriberContext {
    credential: Option<CredentialFile>,
}

impl ClientContext for SubscriberContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> Result<OAuthToken, Box<dyn std::error::Error>> {
        let file = self
            .credential
            .as_ref()
            .ok_or("bearer auth enabled without a credential path")?;
        let token = file.load()?;
        let lifetime_ms = Utc::now().timestamp_millis() + TOKEN_LIFETIME.as_millis() as i64;

        Ok(OAuthToken {
            token,
            principal_name: String::new(),
            lifetime_ms,
        })
    }
}

impl ConsumerContext for SubscriberContext {}

/// Capped exponential backoff for reconnect attempts.
///
/// Retries are unlimited: a long-running service has no terminal
/// disconnected state.
struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: min,
            min,
            max,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Owns the one live bus connection and the receive loop.
pub struct BusSubscriber {
    config: BusConfig,
    writer: StorageWriter,
    state: Arc<ServiceState>,
}

impl BusSubscriber {
    pub fn new(config: BusConfig, writer: StorageWriter, state: Arc<ServiceState>) -> Self {
        Self {
            config,
            writer,
            state,
        }
    }

    /// Spawn the subscriber task. It runs until the stop signal fires.
    pub fn spawn(self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);

        'outer: loop {
            if *stop.borrow() {
                break;
            }

            let consumer = match self.connect() {
                Ok(consumer) => consumer,
                Err(e) => {
                    tracing::warn!(error = %e, "Bus connect failed, backing off");
                    if wait_or_stop(&mut stop, backoff.next()).await {
                        break 'outer;
                    }
                    continue;
                }
            };

            tracing::info!(
                pattern = %self.config.subscribe_pattern,
                "Subscribed to bus"
            );
            self.state.set_bus_connected(true);
            backoff.reset();

            loop {
                tokio::select! {
                    _ = stop.changed() => break 'outer,
                    received = consumer.recv() => match received {
                        Ok(message) => self.handle_message(&message),
                        Err(e) => {
                            tracing::warn!(error = %e, "Bus receive failed, reconnecting");
                            break;
                        }
                    }
                }
            }

            self.state.set_bus_connected(false);
            if wait_or_stop(&mut stop, backoff.next()).await {
                break 'outer;
            }
        }

        // Dropping the consumer closes the connection.
        self.state.set_bus_connected(false);
        tracing::info!("Bus subscriber stopped");
    }

    /// Create a consumer and subscribe with the wildcard pattern.
    ///
    /// The bearer token is fetched lazily by the client context, so it is
    /// fresh on every (re)connect.
    fn connect(&self) -> Result<StreamConsumer<SubscriberContext>, BusError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set(
                "bootstrap.servers",
                format!("{}:{}", self.config.host, self.config.port),
            )
            .set("group.id", &self.config.group_id)
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "true");

        let credential = match self.config.auth.method {
            BusAuthMethod::None => None,
            BusAuthMethod::Bearer => {
                client_config
                    .set("security.protocol", "sasl_ssl")
                    .set("sasl.mechanism", "OAUTHBEARER");
                let path = self.config.auth.credential_path.as_ref().ok_or_else(|| {
                    BusError::Config("bearer auth requires a credential_path".to_string())
                })?;
                Some(CredentialFile::new(path))
            }
        };

        let context = SubscriberContext { credential };
        let consumer: StreamConsumer<SubscriberContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[self.config.subscribe_pattern.as_str()])?;

        Ok(consumer)
    }

    /// Sanitize one inbound message and enqueue it. Never blocks.
    fn handle_message<M: Message>(&self, message: &M) {
        let envelope = envelope_from_message(message);
        let topic = envelope.topic.clone();
        let draft = sanitize::normalize(envelope);

        match self.writer.insert_message(draft) {
            Ok(()) => {}
            // Already counted by the writer; dropping is the policy, not a fault.
            Err(StorageError::QueueFull) => {}
            Err(e) => {
                tracing::error!(error = %e, topic = %topic, "Failed to enqueue message");
            }
        }
    }
}

/// Build a raw envelope from a bus message, stamping the receipt time.
fn envelope_from_message<M: Message>(message: &M) -> RawEnvelope {
    RawEnvelope {
        topic: message.topic().to_string(),
        payload: message.payload().unwrap_or_default().to_vec(),
        qos: qos_from_headers(message),
        receipt_time: Utc::now(),
    }
}

/// Parse the `qos` header as a small integer; absent or unparsable means 0.
fn qos_from_headers<M: Message>(message: &M) -> u8 {
    message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == QOS_HEADER)
                .and_then(|header| header.value)
        })
        .and_then(|value| std::str::from_utf8(value).ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Sleep for `delay` unless the stop signal fires first. Returns true on stop.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.changed() => true,
    }
}
