//! Monitor supervisors: poll sources on an interval and feed the queue.

pub mod group;
pub mod source_monitor;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::Source;
use crate::sources::SourceMetadata;

pub use group::MonitorGroup;
pub use source_monitor::{MonitorConfig, SourceMonitor};

/// Lifecycle of a monitor.
///
/// ```text
/// idle --start--> running --stop--> stopped --start--> running
/// running --(retries exhausted)--> error --start--> running
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    #[default]
    Idle,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a monitor.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub state: MonitorState,
    pub healthy: bool,
    pub last_poll_time: Option<DateTime<Utc>>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_enqueued: u64,
    pub total_duplicates: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_metadata: Option<SourceMetadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<MonitorStatus>,
}

#[async_trait]
pub trait Monitor: Send + Sync {
    fn name(&self) -> &str;

    /// Begin polling. No-op if already running.
    async fn start(&self);

    /// Stop polling, letting an in-flight tick finish. Idempotent.
    async fn stop(&self);

    async fn status(&self) -> MonitorStatus;

    /// Running or idle, with no unrecovered error from the last poll.
    fn is_healthy(&self) -> bool;
}
