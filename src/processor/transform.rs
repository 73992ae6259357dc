//! Message transform: the opaque content → processed-content step.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProcessingError;
use crate::model::MessageContent;

/// Settings key holding a user's [`ProcessingOptions`].
pub const PROCESSING_OPTIONS_KEY: &str = "processing_options";

/// Summary length produced by [`PassthroughTransform`].
const SUMMARY_MAX_CHARS: usize = 280;

/// Per-user knobs passed to the transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessingOptions {
    /// Produce voice output alongside text.
    pub voice_enabled: bool,
    /// Preferred output language (BCP 47), if any.
    pub language: Option<String>,
}

/// Transform output, stored as the queue item's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMessage {
    pub summary: String,
    #[serde(default)]
    pub output: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageTransform: Send + Sync {
    async fn transform(
        &self,
        message: &MessageContent,
        options: &ProcessingOptions,
    ) -> Result<ProcessedMessage, ProcessingError>;
}

/// Local transform: truncated summary, options echoed back.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTransform;

#[async_trait]
impl MessageTransform for PassthroughTransform {
    async fn transform(
        &self,
        message: &MessageContent,
        options: &ProcessingOptions,
    ) -> Result<ProcessedMessage, ProcessingError> {
        Ok(ProcessedMessage {
            summary: truncate(&message.content, SUMMARY_MAX_CHARS),
            output: serde_json::json!({
                "subject": message.subject,
                "source": message.source,
                "options": options,
            }),
            processed_at: Utc::now(),
        })
    }
}

/// Remote transform: POSTs `{message, options}` and expects a
/// [`ProcessedMessage`]-shaped JSON reply.
pub struct HttpTransform {
    client: reqwest::Client,
    url: String,
}

impl HttpTransform {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProcessingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessingError::Transform(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[derive(Deserialize)]
struct RemoteReply {
    summary: String,
    #[serde(default)]
    output: serde_json::Value,
}

#[async_trait]
impl MessageTransform for HttpTransform {
    async fn transform(
        &self,
        message: &MessageContent,
        options: &ProcessingOptions,
    ) -> Result<ProcessedMessage, ProcessingError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "message": message, "options": options }))
            .send()
            .await
            .map_err(|e| ProcessingError::Transform(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, "Transform endpoint returned error");
            return Err(ProcessingError::Transform(format!(
                "transform endpoint returned {status}"
            )));
        }

        let reply: RemoteReply = resp
            .json()
            .await
            .map_err(|e| ProcessingError::Transform(format!("invalid transform response: {e}")))?;

        Ok(ProcessedMessage {
            summary: reply.summary,
            output: reply.output,
            processed_at: Utc::now(),
        })
    }
}

/// Cut at a char boundary, appending `…` when shortened.
fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("  short  ", 10), "short");
        let long = "é".repeat(20);
        let cut = truncate(&long, 5);
        assert_eq!(cut.chars().count(), 5);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: ProcessingOptions =
            serde_json::from_value(serde_json::json!({"voiceEnabled": true})).unwrap();
        assert!(opts.voice_enabled);
        assert!(opts.language.is_none());

        let empty: ProcessingOptions = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(empty, ProcessingOptions::default());
    }

    #[tokio::test]
    async fn passthrough_echoes_options() {
        let msg = MessageContent::new("u1", Source::Slack, "C1:1", "the build is green", Utc::now())
            .with_subject("CI");
        let opts = ProcessingOptions {
            voice_enabled: true,
            language: None,
        };
        let out = PassthroughTransform.transform(&msg, &opts).await.unwrap();
        assert_eq!(out.summary, "the build is green");
        assert_eq!(out.output["options"]["voiceEnabled"], true);
        assert_eq!(out.output["source"], "SLACK");
    }
}
