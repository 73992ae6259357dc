//! Message source adapters: translate one provider's messages into
//! [`MessageContent`] and own that provider's session lifecycle.
//!
//! The rest of the relay only ever sees `dyn MessageSource`; the provider
//! is chosen once, by [`Source`] discriminant, in [`create_source`].

pub mod gmail;
pub mod slack;
pub mod teams;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SourceError;
use crate::model::{MessageContent, Source};
use crate::store::CredentialStore;

pub use gmail::GmailSource;
pub use slack::SlackSource;
pub use teams::TeamsSource;

/// Default page size when a filter does not set `limit`.
pub const DEFAULT_FETCH_LIMIT: usize = 50;

/// Optional constraints for [`MessageSource::fetch_messages`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub unread_only: bool,
}

impl FetchFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_FETCH_LIMIT).max(1)
    }
}

/// Best-effort sync statistics for one adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    pub last_sync_time: Option<DateTime<Utc>>,
    pub total_fetched: u64,
    pub last_batch: usize,
    pub connected: bool,
    /// Provider account the session belongs to, when the provider reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

/// Per-adapter configuration.
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    /// User whose credentials and messages this adapter handles.
    pub user_id: String,
    /// Override for the provider API root. `None` uses the public endpoint.
    pub base_url: Option<String>,
    /// Channel/conversation ids to read (Slack only).
    pub channels: Vec<String>,
}

impl AdapterConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }
}

/// One provider's connection: credentials in, normalized messages out.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Provenance tag stamped on every fetched message.
    fn source(&self) -> Source;

    /// Load credentials and verify them with the provider.
    async fn initialize(&self) -> Result<(), SourceError>;

    /// Fetch messages matching `filter`. An empty result is `Ok(vec![])`.
    async fn fetch_messages(
        &self,
        filter: &FetchFilter,
    ) -> Result<Vec<MessageContent>, SourceError>;

    /// Current sync statistics. Never fails.
    async fn metadata(&self) -> SourceMetadata;

    /// Drop the provider session. Safe to call repeatedly.
    async fn disconnect(&self);
}

/// Build the adapter for `source`.
pub fn create_source(
    source: Source,
    config: AdapterConfig,
    credentials: Arc<dyn CredentialStore>,
) -> Arc<dyn MessageSource> {
    match source {
        Source::Gmail => Arc::new(GmailSource::new(config, credentials)),
        Source::Slack => Arc::new(SlackSource::new(config, credentials)),
        Source::Teams => Arc::new(TeamsSource::new(config, credentials)),
    }
}

// ── Shared adapter plumbing ─────────────────────────────────────────

/// Session token plus sync stats, shared by every adapter.
#[derive(Default)]
pub(crate) struct SessionState {
    token: RwLock<Option<SecretString>>,
    stats: RwLock<SourceMetadata>,
}

impl SessionState {
    pub(crate) async fn connect(&self, token: SecretString, account: Option<String>) {
        *self.token.write().await = Some(token);
        let mut stats = self.stats.write().await;
        stats.connected = true;
        stats.account = account;
    }

    pub(crate) async fn disconnect(&self) {
        *self.token.write().await = None;
        self.stats.write().await.connected = false;
    }

    /// Clone of the active token, or `NotConnected`.
    pub(crate) async fn token(&self, provider: Source) -> Result<SecretString, SourceError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or(SourceError::NotConnected { provider })
    }

    pub(crate) async fn record_sync(&self, fetched: usize) {
        let mut stats = self.stats.write().await;
        stats.last_sync_time = Some(Utc::now());
        stats.last_batch = fetched;
        stats.total_fetched += fetched as u64;
    }

    pub(crate) async fn snapshot(&self) -> SourceMetadata {
        self.stats.read().await.clone()
    }
}

/// Look up the stored access token for `user_id` on `provider`.
pub(crate) async fn load_token(
    credentials: &dyn CredentialStore,
    user_id: &str,
    provider: Source,
) -> Result<SecretString, SourceError> {
    let stored = credentials
        .get_credentials(user_id, provider)
        .await
        .map_err(|e| SourceError::Unavailable {
            provider,
            reason: format!("credential lookup failed: {e}"),
        })?
        .ok_or_else(|| SourceError::CredentialsNotFound {
            user_id: user_id.to_string(),
            provider,
        })?;

    if stored.is_expired(Utc::now()) {
        return Err(SourceError::Auth {
            provider,
            reason: "stored access token has expired".into(),
        });
    }
    Ok(stored.access_token)
}

pub(crate) fn transport_error(provider: Source, err: reqwest::Error) -> SourceError {
    SourceError::Unavailable {
        provider,
        reason: err.to_string(),
    }
}

/// Map HTTP status to the adapter error taxonomy.
pub(crate) async fn check_status(
    provider: Source,
    resp: reqwest::Response,
) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    debug!(provider = %provider, status = %status, body = %body, "Provider returned error status");

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(SourceError::Auth {
            provider,
            reason: format!("HTTP {status}"),
        })
    } else {
        Err(SourceError::Unavailable {
            provider,
            reason: format!("HTTP {status}"),
        })
    }
}

/// Decode a JSON body into `T`.
pub(crate) async fn decode<T: serde::de::DeserializeOwned>(
    provider: Source,
    resp: reqwest::Response,
) -> Result<T, SourceError> {
    resp.json::<T>()
        .await
        .map_err(|e| SourceError::InvalidResponse {
            provider,
            reason: e.to_string(),
        })
}

/// Keep messages inside the filter window, newest first, capped at the limit.
pub(crate) fn apply_window(mut messages: Vec<MessageContent>, filter: &FetchFilter) -> Vec<MessageContent> {
    messages.retain(|m| {
        filter.since.is_none_or(|since| m.timestamp >= since)
            && filter.until.is_none_or(|until| m.timestamp <= until)
    });
    messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    messages.truncate(filter.effective_limit());
    messages
}
