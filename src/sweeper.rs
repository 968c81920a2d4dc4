//! Retention sweeper: timer-driven purge of aged records.
//!
//! Each tick requests a purge of everything whose `received_at` is older
//! than the retention window. The delete runs through the writer channel in
//! bounded batches, so it serializes with ongoing writes and never holds the
//! table for the full sweep. Sweeps are idempotent; a tick with no aged data
//! is a no-op.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RetentionConfig;
use crate::storage::StorageAdmin;

/// Periodically purges records older than the retention window.
pub struct RetentionSweeper {
    admin: StorageAdmin,
    window: Duration,
    interval: Duration,
    batch_size: usize,
}

impl RetentionSweeper {
    pub fn new(admin: StorageAdmin, config: &RetentionConfig) -> Self {
        Self {
            admin,
            window: config.window,
            interval: config.sweep_interval,
            batch_size: config.sweep_batch_size,
        }
    }

    /// Spawn the sweeper task. It runs until the stop signal fires.
    pub fn spawn(self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                window = %humantime::format_duration(self.window),
                interval = %humantime::format_duration(self.interval),
                "Retention sweeper started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.admin.sweep(self.window, self.batch_size) {
                            // Queue full or closed; the next tick retries.
                            tracing::warn!(error = %e, "Retention sweep request failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }

            tracing::info!("Retention sweeper stopped");
        })
    }
}
