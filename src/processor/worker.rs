//! Queue processor: leases items, runs the transform, records the outcome,
//! and notifies the owning user.
//!
//! Flow per tick:
//! 1. Lease a batch; expired leases reaped by the same call that turned
//!    terminal are announced as `message.failed`
//! 2. Transform each item under a timeout, then `complete` or `fail`
//! 3. Yield, and keep draining while batches come back non-empty

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, ProcessingError};
use crate::model::{FailOutcome, QueueItem, QueueStatus};
use crate::processor::transform::{
    MessageTransform, PROCESSING_OPTIONS_KEY, ProcessedMessage, ProcessingOptions,
};
use crate::push::PushRegistry;
use crate::queue::Backoff;
use crate::store::{QueueStore, SettingsStore};

pub const EVENT_COMPLETED: &str = "message.completed";
pub const EVENT_FAILED: &str = "message.failed";

/// Upper bound on back-to-back batches within one tick.
const MAX_BATCHES_PER_TICK: usize = 100;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub worker_id: String,
    pub batch_size: usize,
    /// Pause between ticks once the queue is drained.
    pub interval: Duration,
    pub backoff: Backoff,
    pub transform_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            batch_size: 10,
            interval: Duration::from_secs(1),
            backoff: Backoff::default(),
            transform_timeout: Duration::from_secs(20),
        }
    }
}

/// Per-batch tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub leased: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct QueueProcessor {
    store: Arc<dyn QueueStore>,
    settings: Arc<dyn SettingsStore>,
    transform: Arc<dyn MessageTransform>,
    push: Arc<PushRegistry>,
    config: ProcessorConfig,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        settings: Arc<dyn SettingsStore>,
        transform: Arc<dyn MessageTransform>,
        push: Arc<PushRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            settings,
            transform,
            push,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Stored options for `user_id`; defaults when unset or unreadable.
    async fn load_options(&self, user_id: &str) -> ProcessingOptions {
        match self.settings.get_setting(user_id, PROCESSING_OPTIONS_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(user_id, error = %e, "Malformed processing options, using defaults");
                ProcessingOptions::default()
            }),
            Ok(None) => ProcessingOptions::default(),
            Err(e) => {
                warn!(user_id, error = %e, "Failed to load processing options, using defaults");
                ProcessingOptions::default()
            }
        }
    }

    /// Process one leased item and record the outcome.
    ///
    /// Transform errors are recorded with `fail` and then returned. A store
    /// error while recording leaves the lease in place, so the item comes
    /// back once its visibility timeout lapses.
    pub async fn process_item(&self, item: &QueueItem) -> Result<ProcessedMessage, ProcessingError> {
        debug!(
            item_id = %item.id,
            user_id = %item.user_id,
            source = %item.source,
            attempt = item.retry_count + 1,
            "Processing queue item"
        );

        let options = self.load_options(&item.user_id).await;
        let outcome = tokio::time::timeout(
            self.config.transform_timeout,
            self.transform.transform(&item.payload, &options),
        )
        .await
        .unwrap_or(Err(ProcessingError::Timeout(self.config.transform_timeout)));

        match outcome {
            Ok(processed) => {
                self.record_success(item, &processed).await?;
                Ok(processed)
            }
            Err(e) => {
                self.record_failure(item, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn record_success(
        &self,
        item: &QueueItem,
        processed: &ProcessedMessage,
    ) -> Result<(), ProcessingError> {
        let result = serde_json::to_value(processed)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now();

        if !self
            .store
            .complete(item.id, &self.config.worker_id, Some(&result), now)
            .await?
        {
            warn!(item_id = %item.id, worker_id = %self.config.worker_id, "Lease lost before completion");
            return Ok(());
        }

        let mut done = item.clone();
        done.status = QueueStatus::Completed;
        done.error = None;
        done.result = Some(result);
        done.completed_at = Some(now);
        done.updated_at = now;

        info!(item_id = %item.id, user_id = %item.user_id, "Queue item completed");
        self.push.push(&item.user_id, EVENT_COMPLETED, outcome_payload(&done));
        Ok(())
    }

    async fn record_failure(&self, item: &QueueItem, reason: &str) -> Result<(), ProcessingError> {
        match self
            .store
            .fail(
                item.id,
                &self.config.worker_id,
                reason,
                &self.config.backoff,
                Utc::now(),
            )
            .await?
        {
            FailOutcome::Retrying(retrying) => {
                warn!(
                    item_id = %item.id,
                    attempts = retrying.retry_count,
                    max_retries = retrying.max_retries,
                    error = reason,
                    "Queue item failed, will retry"
                );
            }
            FailOutcome::Exhausted(failed) => {
                error!(item_id = %item.id, error = reason, "Queue item failed permanently");
                self.push.push(&failed.user_id, EVENT_FAILED, outcome_payload(&failed));
            }
            FailOutcome::NotLeased => {
                warn!(item_id = %item.id, "Lease lost before failure was recorded");
            }
        }
        Ok(())
    }

    /// Process a leased batch. Per-item errors are logged, never propagated.
    pub async fn process_batch(&self, items: Vec<QueueItem>) -> BatchReport {
        let mut report = BatchReport {
            leased: items.len(),
            ..BatchReport::default()
        };

        for item in items {
            match self.process_item(&item).await {
                Ok(_) => report.completed += 1,
                Err(ProcessingError::Store(e)) => {
                    error!(item_id = %item.id, error = %e, "Failed to record outcome");
                }
                Err(e) => {
                    if item.retry_count + 1 >= item.max_retries {
                        report.failed += 1;
                    } else {
                        report.retried += 1;
                    }
                    debug!(item_id = %item.id, error = %e, "Item processing failed");
                }
            }
        }
        report
    }

    /// Announce items that a reap moved to terminal `failed`.
    fn announce_reaped(&self, reaped: &[QueueItem]) {
        for item in reaped.iter().filter(|i| i.status == QueueStatus::Failed) {
            self.push.push(&item.user_id, EVENT_FAILED, outcome_payload(item));
        }
    }

    /// One lease + process pass.
    pub async fn run_once(&self) -> Result<BatchReport, DatabaseError> {
        let batch = self
            .store
            .lease(&self.config.worker_id, self.config.batch_size, Utc::now())
            .await?;
        self.announce_reaped(&batch.reaped);
        if batch.leased.is_empty() {
            return Ok(BatchReport::default());
        }
        Ok(self.process_batch(batch.leased).await)
    }

    /// Spawn the worker loop. Set the returned flag to stop it.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(
                worker_id = %self.config.worker_id,
                batch_size = self.config.batch_size,
                "Queue processor started, polling every {:?}",
                self.config.interval
            );

            let mut tick = tokio::time::interval(self.config.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                if shutdown.load(Ordering::Relaxed) {
                    info!(worker_id = %self.config.worker_id, "Queue processor shutting down");
                    return;
                }

                for _ in 0..MAX_BATCHES_PER_TICK {
                    match self.run_once().await {
                        Ok(report) if report.leased == 0 => break,
                        Ok(report) => {
                            debug!(worker_id = %self.config.worker_id, ?report, "Batch processed");
                        }
                        Err(e) => {
                            error!(worker_id = %self.config.worker_id, error = %e, "Queue poll failed");
                            break;
                        }
                    }
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        });

        (handle, shutdown_flag)
    }
}

/// Event body for `message.completed` / `message.failed`.
pub fn outcome_payload(item: &QueueItem) -> serde_json::Value {
    json!({
        "itemId": item.id,
        "messageId": item.message_id,
        "source": item.source,
        "status": item.status,
        "retryCount": item.retry_count,
        "result": item.result,
        "error": item.error,
        "message": item.message_view(),
    })
}
