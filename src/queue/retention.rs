//! Periodic deletion of terminal queue items past their retention window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::DatabaseError;
use crate::store::QueueStore;

pub struct RetentionSweep {
    store: Arc<dyn QueueStore>,
    /// Terminal items last updated longer ago than this are deleted.
    retention: Duration,
    interval: Duration,
}

impl RetentionSweep {
    pub fn new(store: Arc<dyn QueueStore>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    /// Delete terminal items older than the retention window at `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let window = TimeDelta::from_std(self.retention).unwrap_or(TimeDelta::MAX);
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return Ok(0);
        };
        self.store.prune_terminal(cutoff).await
    }

    /// Spawn the sweep loop. Set the returned flag to stop it.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(
                retention_secs = self.retention.as_secs(),
                "Retention sweep started, running every {:?}",
                self.interval
            );

            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                if shutdown.load(Ordering::Relaxed) {
                    info!("Retention sweep shutting down");
                    return;
                }

                match self.sweep_once(Utc::now()).await {
                    Ok(deleted) => debug!(deleted, "Retention sweep finished"),
                    Err(e) => error!(error = %e, "Retention sweep failed"),
                }
            }
        });

        (handle, shutdown_flag)
    }
}
