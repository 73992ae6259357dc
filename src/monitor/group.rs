//! Aggregate of monitors exposed as a single [`Monitor`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::info;

use crate::monitor::{Monitor, MonitorState, MonitorStatus};

pub struct MonitorGroup {
    name: String,
    monitors: Vec<Arc<dyn Monitor>>,
}

impl MonitorGroup {
    pub fn new(name: impl Into<String>, monitors: Vec<Arc<dyn Monitor>>) -> Self {
        Self {
            name: name.into(),
            monitors,
        }
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

/// Running if any member runs; otherwise error, stopped, or idle in that order.
fn aggregate_state(members: &[MonitorStatus]) -> MonitorState {
    let any = |state| members.iter().any(|m| m.state == state);
    if any(MonitorState::Running) {
        MonitorState::Running
    } else if any(MonitorState::Error) {
        MonitorState::Error
    } else if !members.is_empty() && members.iter().all(|m| m.state == MonitorState::Stopped) {
        MonitorState::Stopped
    } else {
        MonitorState::Idle
    }
}

#[async_trait]
impl Monitor for MonitorGroup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) {
        info!(group = %self.name, monitors = self.monitors.len(), "Starting monitors");
        join_all(self.monitors.iter().map(|m| m.start())).await;
    }

    async fn stop(&self) {
        join_all(self.monitors.iter().map(|m| m.stop())).await;
        info!(group = %self.name, "Monitors stopped");
    }

    async fn status(&self) -> MonitorStatus {
        let members = join_all(self.monitors.iter().map(|m| m.status())).await;
        MonitorStatus {
            name: self.name.clone(),
            source: None,
            state: aggregate_state(&members),
            healthy: self.is_healthy(),
            last_poll_time: members.iter().filter_map(|m| m.last_poll_time).max(),
            last_sync_time: members.iter().filter_map(|m| m.last_sync_time).max(),
            last_error: members.iter().find_map(|m| m.last_error.clone()),
            consecutive_failures: members
                .iter()
                .map(|m| m.consecutive_failures)
                .max()
                .unwrap_or(0),
            total_enqueued: members.iter().map(|m| m.total_enqueued).sum(),
            total_duplicates: members.iter().map(|m| m.total_duplicates).sum(),
            source_metadata: None,
            members,
        }
    }

    /// Healthy iff every member is healthy. An empty group is healthy.
    fn is_healthy(&self) -> bool {
        self.monitors.iter().all(|m| m.is_healthy())
    }
}
