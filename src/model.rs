//! Core data model for normalized messages and queue items.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retry budget for a queue item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default visibility timeout for a lease.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest visibility timeout an item may carry.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

// ── Source ──────────────────────────────────────────────────────────

/// Provenance tag for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Gmail,
    Slack,
    Teams,
}

impl Source {
    /// All known sources.
    pub const ALL: [Source; 3] = [Source::Gmail, Source::Slack, Source::Teams];

    /// Canonical storage/wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "GMAIL",
            Self::Slack => "SLACK",
            Self::Teams => "TEAMS",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GMAIL" => Ok(Self::Gmail),
            "SLACK" => Ok(Self::Slack),
            "TEAMS" => Ok(Self::Teams),
            other => Err(format!("unknown message source: {other}")),
        }
    }
}

// ── MessageContent ──────────────────────────────────────────────────

/// Lifecycle stage of a message as seen by clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A message normalized from any provider.
///
/// `(user_id, source, source_id)` identifies the message across re-fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    /// External identifier assigned by the provider, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub source: Source,
    /// Provider-native identifier, unique within (user_id, source).
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque provider metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub status: MessageStatus,
    /// Last failure description; only set when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageContent {
    /// Create a pending message with the required fields.
    pub fn new(
        user_id: impl Into<String>,
        source: Source,
        source_id: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            user_id: user_id.into(),
            source,
            source_id: source_id.into(),
            subject: None,
            content: content.into(),
            timestamp,
            metadata: serde_json::Map::new(),
            status: MessageStatus::Pending,
            error: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check the required fields. Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("userId must not be empty".into());
        }
        if self.source_id.trim().is_empty() {
            return Err("sourceId must not be empty".into());
        }
        if self.content.is_empty() {
            return Err("content must not be empty".into());
        }
        Ok(())
    }
}

// ── Queue ───────────────────────────────────────────────────────────

/// State of a queue item.
///
/// ```text
/// pending --lease--> processing --complete--> completed
/// processing --fail (retries left)--> pending
/// processing --fail (exhausted)--> failed
/// pending --cancel--> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal items are kept for history and never leased again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: QueueStatus) -> bool {
        use QueueStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// A durable unit of work wrapping a [`MessageContent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: Uuid,
    pub user_id: String,
    pub message_id: String,
    pub source: Source,
    /// Higher is served first.
    pub priority: i64,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub visibility_timeout_ms: u64,
    /// Not leasable before this instant.
    pub visible_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub payload: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl QueueItem {
    /// Whether a lease on this item is still live at `now`.
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Processing && self.visible_after > now
    }

    /// The payload with its lifecycle fields mirrored from the item.
    pub fn message_view(&self) -> MessageContent {
        let mut message = self.payload.clone();
        message.status = match self.status {
            QueueStatus::Pending | QueueStatus::Cancelled => MessageStatus::Pending,
            QueueStatus::Processing => MessageStatus::Processing,
            QueueStatus::Completed => MessageStatus::Completed,
            QueueStatus::Failed => MessageStatus::Failed,
        };
        message.error = if self.status == QueueStatus::Failed {
            self.error.clone()
        } else {
            None
        };
        message
    }
}

/// Per-item options accepted by `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub max_retries: u32,
    pub visibility_timeout: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

impl EnqueueOptions {
    /// Check the retry budget and lease length.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("maxRetries must be at least 1".into());
        }
        if self.visibility_timeout.is_zero() {
            return Err("visibility timeout must be positive".into());
        }
        if self.visibility_timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(format!(
                "visibility timeout must not exceed {}s",
                MAX_VISIBILITY_TIMEOUT.as_secs()
            ));
        }
        Ok(())
    }
}

/// Result of an `enqueue` call.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new pending item was created.
    Enqueued(QueueItem),
    /// A live (or already completed) item exists for the same message.
    Duplicate { existing_id: Uuid },
}

impl EnqueueOutcome {
    pub fn item_id(&self) -> Uuid {
        match self {
            Self::Enqueued(item) => item.id,
            Self::Duplicate { existing_id } => *existing_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Result of a `lease` call.
#[derive(Debug, Clone, Default)]
pub struct LeaseBatch {
    /// Items now held by the caller, in lease order.
    pub leased: Vec<QueueItem>,
    /// Expired leases reaped in the same transaction, in their new state.
    pub reaped: Vec<QueueItem>,
}

/// Result of a `fail` call.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Re-queued; leasable again after `item.visible_after`.
    Retrying(QueueItem),
    /// Retries exhausted; the item is terminal.
    Exhausted(QueueItem),
    /// The caller no longer holds the lease, or the id is unknown.
    NotLeased,
}

/// Aggregate queue counts and throughput.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending_count: u64,
    pub processing_count: u64,
    pub by_status: BTreeMap<String, u64>,
    pub total_processed: u64,
    pub total_failed: u64,
    /// Mean lease-to-completion time in milliseconds.
    #[serde(rename = "averageProcessingTime")]
    pub average_processing_time_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parses_case_insensitively() {
        assert_eq!("gmail".parse::<Source>().unwrap(), Source::Gmail);
        assert_eq!(" Teams ".parse::<Source>().unwrap(), Source::Teams);
        assert!("outlook".parse::<Source>().is_err());
    }

    #[test]
    fn source_serializes_uppercase() {
        let json = serde_json::to_string(&Source::Slack).unwrap();
        assert_eq!(json, "\"SLACK\"");
    }

    #[test]
    fn message_content_camel_case_wire_format() {
        let json = r#"{
            "userId": "u1",
            "source": "GMAIL",
            "sourceId": "abc",
            "content": "hello",
            "timestamp": "2026-02-15T10:00:00Z"
        }"#;
        let msg: MessageContent = serde_json::from_str(json).unwrap();
        assert_eq!(msg.user_id, "u1");
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.metadata.is_empty());
        assert!(msg.subject.is_none());

        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["sourceId"], "abc");
        assert!(out.get("error").is_none());
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let ok = MessageContent::new("u1", Source::Gmail, "m1", "body", Utc::now());
        assert!(ok.validate().is_ok());

        let mut no_user = ok.clone();
        no_user.user_id = "  ".into();
        assert!(no_user.validate().is_err());

        let mut no_content = ok.clone();
        no_content.content.clear();
        assert!(no_content.validate().is_err());

        let mut no_source_id = ok;
        no_source_id.source_id.clear();
        assert!(no_source_id.validate().is_err());
    }

    #[test]
    fn enqueue_options_bound_the_lease() {
        assert!(EnqueueOptions::default().validate().is_ok());

        let at_max = EnqueueOptions {
            visibility_timeout: MAX_VISIBILITY_TIMEOUT,
            ..EnqueueOptions::default()
        };
        assert!(at_max.validate().is_ok());

        for timeout in [
            Duration::ZERO,
            MAX_VISIBILITY_TIMEOUT + Duration::from_millis(1),
            Duration::from_secs(u64::MAX),
        ] {
            let options = EnqueueOptions {
                visibility_timeout: timeout,
                ..EnqueueOptions::default()
            };
            assert!(options.validate().is_err(), "{timeout:?} accepted");
        }

        let no_retries = EnqueueOptions {
            max_retries: 0,
            ..EnqueueOptions::default()
        };
        assert!(no_retries.validate().is_err());
    }

    #[test]
    fn queue_state_machine() {
        use QueueStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(Completed.is_terminal() && Failed.is_terminal() && Cancelled.is_terminal());
        assert!(!Pending.is_terminal() && !Processing.is_terminal());
    }

    #[test]
    fn queue_status_roundtrip_strings() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::Failed,
            QueueStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
    }

    #[test]
    fn stats_use_wire_names() {
        let stats = QueueStats {
            average_processing_time_ms: Some(12.5),
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["averageProcessingTime"], 12.5);
        assert_eq!(json["pendingCount"], 0);
    }
}
