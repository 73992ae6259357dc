//! Slack adapter: Web API (`auth.test`, `conversations.history`).
//!
//! Slack answers HTTP 200 for most failures and reports them in the
//! `ok`/`error` envelope, so both layers are checked.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::model::{MessageContent, Source};
use crate::sources::{
    AdapterConfig, FetchFilter, MessageSource, SessionState, SourceMetadata, apply_window,
    check_status, decode, load_token, transport_error,
};
use crate::store::CredentialStore;

const DEFAULT_BASE_URL: &str = "https://slack.com/api";

/// `error` codes that mean the token itself is bad.
const AUTH_ERROR_CODES: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "token_expired",
    "missing_scope",
];

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    error: Option<String>,
    #[serde(flatten)]
    body: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AuthTest {
    user: Option<String>,
    team: Option<String>,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(default)]
    messages: Vec<SlackMessage>,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: String,
    #[serde(default)]
    text: String,
    user: Option<String>,
    subtype: Option<String>,
    thread_ts: Option<String>,
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, SourceError> {
    if !envelope.ok {
        let code = envelope.error.unwrap_or_else(|| "unknown_error".to_string());
        return Err(if AUTH_ERROR_CODES.contains(&code.as_str()) {
            SourceError::Auth {
                provider: Source::Slack,
                reason: code,
            }
        } else {
            SourceError::Unavailable {
                provider: Source::Slack,
                reason: code,
            }
        });
    }
    envelope.body.ok_or_else(|| SourceError::InvalidResponse {
        provider: Source::Slack,
        reason: "missing response body".into(),
    })
}

/// Slack `ts` values are `"<epoch secs>.<micros>"`.
fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{frac:0<6}").get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000)
}

fn format_ts(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

impl SlackMessage {
    fn into_content(self, user_id: &str, channel: &str) -> Option<MessageContent> {
        // Joins, topic changes and similar carry no user text.
        if self.subtype.as_deref().is_some_and(|s| s != "thread_broadcast") {
            return None;
        }
        if self.text.trim().is_empty() {
            return None;
        }
        let timestamp = parse_ts(&self.ts)?;

        let mut message = MessageContent::new(
            user_id,
            Source::Slack,
            format!("{channel}:{}", self.ts),
            self.text,
            timestamp,
        )
        .with_metadata("channel", serde_json::Value::String(channel.to_string()));
        if let Some(author) = self.user {
            message = message.with_metadata("from", serde_json::Value::String(author));
        }
        if let Some(thread) = self.thread_ts {
            message = message.with_metadata("threadTs", serde_json::Value::String(thread));
        }
        Some(message)
    }
}

/// Slack adapter. Reads the channels listed in [`AdapterConfig::channels`].
pub struct SlackSource {
    config: AdapterConfig,
    credentials: Arc<dyn CredentialStore>,
    client: reqwest::Client,
    base_url: String,
    state: SessionState,
}

impl SlackSource {
    pub fn new(config: AdapterConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let base_url = config.base_url_or(DEFAULT_BASE_URL);
        Self {
            config,
            credentials,
            client: reqwest::Client::new(),
            base_url,
            state: SessionState::default(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    async fn channel_history(
        &self,
        token: &str,
        channel: &str,
        filter: &FetchFilter,
    ) -> Result<Vec<MessageContent>, SourceError> {
        let mut query = vec![
            ("channel", channel.to_string()),
            ("limit", filter.effective_limit().to_string()),
        ];
        if let Some(since) = filter.since {
            query.push(("oldest", format_ts(since)));
        }
        if let Some(until) = filter.until {
            query.push(("latest", format_ts(until)));
        }
        if filter.since.is_some() || filter.until.is_some() {
            query.push(("inclusive", "true".to_string()));
        }

        let resp = self
            .client
            .get(self.api_url("conversations.history"))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(|e| transport_error(Source::Slack, e))?;
        let envelope: Envelope<History> =
            decode(Source::Slack, check_status(Source::Slack, resp).await?).await?;
        let history = unwrap_envelope(envelope)?;

        Ok(history
            .messages
            .into_iter()
            .filter_map(|m| m.into_content(&self.config.user_id, channel))
            .collect())
    }
}

#[async_trait]
impl MessageSource for SlackSource {
    fn source(&self) -> Source {
        Source::Slack
    }

    async fn initialize(&self) -> Result<(), SourceError> {
        let token = load_token(self.credentials.as_ref(), &self.config.user_id, Source::Slack).await?;

        let resp = self
            .client
            .post(self.api_url("auth.test"))
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error(Source::Slack, e))?;
        let envelope: Envelope<AuthTest> =
            decode(Source::Slack, check_status(Source::Slack, resp).await?).await?;
        let auth = unwrap_envelope(envelope)?;

        let account = match (auth.user, auth.team) {
            (Some(user), Some(team)) => Some(format!("{user}@{team}")),
            (user, team) => user.or(team),
        };
        info!(user_id = %self.config.user_id, account = ?account, "Slack connected");
        self.state.connect(token, account).await;
        Ok(())
    }

    async fn fetch_messages(
        &self,
        filter: &FetchFilter,
    ) -> Result<Vec<MessageContent>, SourceError> {
        let token = self.state.token(Source::Slack).await?;
        if self.config.channels.is_empty() {
            warn!(user_id = %self.config.user_id, "Slack adapter has no channels configured");
        }
        if filter.unread_only {
            debug!(user_id = %self.config.user_id, "Slack ignores unreadOnly");
        }

        let mut messages = Vec::new();
        for channel in &self.config.channels {
            let batch = self
                .channel_history(token.expose_secret(), channel, filter)
                .await?;
            debug!(channel = %channel, count = batch.len(), "Fetched Slack history");
            messages.extend(batch);
        }

        let messages = apply_window(messages, filter);
        self.state.record_sync(messages.len()).await;
        Ok(messages)
    }

    async fn metadata(&self) -> SourceMetadata {
        self.state.snapshot().await
    }

    async fn disconnect(&self) {
        self.state.disconnect().await;
    }
}
