//! Polling supervisor for one message source.
//!
//! Each tick connects the adapter if needed, fetches messages newer than the
//! last successful sync, and enqueues them. Adapters return the newest page
//! first, so a full page is followed by another one bounded above by the
//! oldest timestamp seen. The sync cursor only moves once a short page shows
//! the window is drained. Failed ticks are retried after
//! `retry_delay`; once `max_retries` consecutive ticks have failed on top of
//! the first one, the monitor stops itself in the `error` state.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::model::{EnqueueOptions, MessageContent};
use crate::monitor::{Monitor, MonitorState, MonitorStatus};
use crate::sources::{FetchFilter, MessageSource};
use crate::store::QueueStore;

/// Pages fetched per tick before the rest of a burst waits for the next tick.
const MAX_PAGES_PER_TICK: usize = 20;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Consecutive failed ticks tolerated before giving up.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub fetch_limit: usize,
    pub unread_only: bool,
    /// How far back the first poll reaches. `None` fetches the provider default page.
    pub initial_lookback: Option<Duration>,
    pub enqueue: EnqueueOptions,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_secs(10),
            fetch_limit: 50,
            unread_only: false,
            initial_lookback: Some(Duration::from_secs(24 * 3600)),
            enqueue: EnqueueOptions::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    state: MonitorState,
    last_poll: Option<DateTime<Utc>>,
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    total_enqueued: u64,
    total_duplicates: u64,
}

struct Running {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// Outcome of one successful tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub enqueued: usize,
    pub duplicates: usize,
}

pub struct SourceMonitor {
    name: String,
    source: Arc<dyn MessageSource>,
    store: Arc<dyn QueueStore>,
    config: MonitorConfig,
    progress: Arc<Mutex<Progress>>,
    task: tokio::sync::Mutex<Option<Running>>,
}

impl SourceMonitor {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn MessageSource>,
        store: Arc<dyn QueueStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            store,
            config,
            progress: Arc::new(Mutex::new(Progress::default())),
            task: tokio::sync::Mutex::new(None),
        }
    }

    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a single poll outside the loop.
    pub async fn poll_once(&self) -> Result<TickReport, Error> {
        let ctx = TickContext {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            progress: Arc::clone(&self.progress),
        };
        ctx.tick().await
    }
}

/// Everything the polling task needs, detached from `&self`.
struct TickContext {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn QueueStore>,
    config: MonitorConfig,
    progress: Arc<Mutex<Progress>>,
}

impl TickContext {
    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn filter(&self, now: DateTime<Utc>) -> FetchFilter {
        let since = self.progress().last_sync.or_else(|| {
            self.config
                .initial_lookback
                .and_then(|d| chrono::TimeDelta::from_std(d).ok())
                .map(|d| now - d)
        });
        FetchFilter {
            since,
            until: None,
            limit: Some(self.config.fetch_limit),
            unread_only: self.config.unread_only,
        }
    }

    async fn fetch(&self, filter: &FetchFilter) -> Result<Vec<MessageContent>, Error> {
        match self.source.fetch_messages(filter).await {
            Ok(messages) => Ok(messages),
            Err(e) => {
                if !e.is_retryable() {
                    // Force a fresh credential load on the next tick.
                    self.source.disconnect().await;
                }
                Err(e.into())
            }
        }
    }

    async fn enqueue_page(
        &self,
        page: &[MessageContent],
        report: &mut TickReport,
    ) -> Result<(), Error> {
        report.fetched += page.len();
        for message in page {
            let outcome = self
                .store
                .enqueue(message, self.config.enqueue, Utc::now())
                .await?;
            if outcome.is_duplicate() {
                report.duplicates += 1;
            } else {
                report.enqueued += 1;
            }
        }
        Ok(())
    }

    async fn tick(&self) -> Result<TickReport, Error> {
        let started = Utc::now();
        self.progress().last_poll = Some(started);

        if !self.source.metadata().await.connected {
            self.source.initialize().await?;
        }

        let mut filter = self.filter(started);
        let limit = filter.effective_limit();
        let mut report = TickReport::default();
        let mut drained = false;

        for _ in 0..MAX_PAGES_PER_TICK {
            let page = self.fetch(&filter).await?;
            self.enqueue_page(&page, &mut report).await?;

            let oldest = page.iter().map(|m| m.timestamp).min();
            match oldest {
                Some(oldest) if page.len() >= limit => {
                    if filter.until.is_some_and(|until| oldest >= until) {
                        warn!(
                            source = %self.source.source(),
                            until = %oldest,
                            "Source returned a full page without moving back, deferring the rest"
                        );
                        break;
                    }
                    filter.until = Some(oldest);
                }
                _ => {
                    drained = true;
                    break;
                }
            }
        }

        let mut progress = self.progress();
        if drained {
            progress.last_sync = Some(started);
        } else {
            debug!(
                source = %self.source.source(),
                "Window not drained, keeping sync cursor at {:?}",
                progress.last_sync
            );
        }
        progress.total_enqueued += report.enqueued as u64;
        progress.total_duplicates += report.duplicates as u64;
        Ok(report)
    }

    /// Record a tick outcome. Returns the delay before the next tick, or
    /// `None` when retries are exhausted.
    fn settle(&self, source: &str, outcome: Result<TickReport, Error>) -> Option<Duration> {
        let mut progress = self.progress();
        match outcome {
            Ok(report) => {
                if progress.consecutive_failures > 0 {
                    info!(source, "Poll recovered after {} failure(s)", progress.consecutive_failures);
                }
                progress.consecutive_failures = 0;
                progress.last_error = None;
                if report.fetched > 0 {
                    debug!(source, ?report, "Poll complete");
                }
                Some(self.config.poll_interval)
            }
            Err(e) => {
                progress.consecutive_failures += 1;
                progress.last_error = Some(e.to_string());
                if progress.consecutive_failures > self.config.max_retries {
                    error!(
                        source,
                        failures = progress.consecutive_failures,
                        error = %e,
                        "Poll retries exhausted, monitor stopping"
                    );
                    progress.state = MonitorState::Error;
                    None
                } else {
                    warn!(
                        source,
                        failures = progress.consecutive_failures,
                        error = %e,
                        "Poll failed, retrying in {:?}",
                        self.config.retry_delay
                    );
                    Some(self.config.retry_delay)
                }
            }
        }
    }
}

#[async_trait]
impl Monitor for SourceMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!(monitor = %self.name, "Monitor already running");
            return;
        }

        {
            let mut progress = self.progress();
            progress.state = MonitorState::Running;
            progress.consecutive_failures = 0;
            progress.last_error = None;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let ctx = TickContext {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            progress: Arc::clone(&self.progress),
        };
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            info!(
                monitor = %name,
                source = %ctx.source.source(),
                "Monitor started, polling every {:?}",
                ctx.config.poll_interval
            );

            loop {
                if *stop_rx.borrow() {
                    break;
                }

                let outcome = ctx.tick().await;
                let Some(delay) = ctx.settle(&name, outcome) else {
                    return;
                };

                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            info!(monitor = %name, "Monitor shutting down");
        });

        *task = Some(Running { handle, stop_tx });
    }

    async fn stop(&self) {
        let Some(running) = self.task.lock().await.take() else {
            return;
        };
        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            error!(monitor = %self.name, error = %e, "Monitor task panicked");
        }

        self.source.disconnect().await;
        let mut progress = self.progress();
        if progress.state == MonitorState::Running {
            progress.state = MonitorState::Stopped;
        }
    }

    async fn status(&self) -> MonitorStatus {
        let source_metadata = self.source.metadata().await;
        let progress = self.progress();
        MonitorStatus {
            name: self.name.clone(),
            source: Some(self.source.source()),
            state: progress.state,
            healthy: is_healthy(&progress),
            last_poll_time: progress.last_poll,
            last_sync_time: progress.last_sync,
            last_error: progress.last_error.clone(),
            consecutive_failures: progress.consecutive_failures,
            total_enqueued: progress.total_enqueued,
            total_duplicates: progress.total_duplicates,
            source_metadata: Some(source_metadata),
            members: Vec::new(),
        }
    }

    fn is_healthy(&self) -> bool {
        is_healthy(&self.progress())
    }
}

fn is_healthy(progress: &Progress) -> bool {
    matches!(progress.state, MonitorState::Running | MonitorState::Idle)
        && progress.last_error.is_none()
}
