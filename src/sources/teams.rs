//! Microsoft Teams adapter: Graph `me/chats/getAllMessages`.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::SourceError;
use crate::model::{MessageContent, Source};
use crate::sources::{
    AdapterConfig, FetchFilter, MessageSource, SessionState, SourceMetadata, apply_window,
    check_status, decode, load_token, transport_error,
};
use crate::store::CredentialStore;

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern"));
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("space pattern"));

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Me {
    display_name: Option<String>,
    user_principal_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    value: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessage {
    id: String,
    chat_id: Option<String>,
    created_date_time: Option<DateTime<Utc>>,
    last_modified_date_time: Option<DateTime<Utc>>,
    subject: Option<String>,
    message_type: Option<String>,
    body: Option<ItemBody>,
    from: Option<Sender>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    content_type: Option<String>,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct Sender {
    user: Option<Identity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    display_name: Option<String>,
}

/// Reduce a Teams HTML body to plain text.
pub(crate) fn strip_html(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    SPACE_RE.replace_all(&text, " ").trim().to_string()
}

fn graph_filter(filter: &FetchFilter) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(since) = filter.since {
        clauses.push(format!(
            "lastModifiedDateTime gt {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    if let Some(until) = filter.until {
        clauses.push(format!(
            "lastModifiedDateTime lt {}",
            until.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    (!clauses.is_empty()).then(|| clauses.join(" and "))
}

impl ChatMessage {
    fn into_content(self, user_id: &str) -> Option<MessageContent> {
        if self.message_type.as_deref().is_some_and(|t| t != "message") {
            return None;
        }
        let body = self.body?;
        let text = match body.content_type.as_deref() {
            Some(kind) if kind.eq_ignore_ascii_case("html") => strip_html(&body.content),
            _ => body.content.trim().to_string(),
        };
        if text.is_empty() {
            return None;
        }
        let timestamp = self
            .created_date_time
            .or(self.last_modified_date_time)
            .unwrap_or_else(Utc::now);

        let mut message = MessageContent::new(user_id, Source::Teams, self.id, text, timestamp);
        if let Some(subject) = self.subject.filter(|s| !s.is_empty()) {
            message = message.with_subject(subject);
        }
        if let Some(chat_id) = self.chat_id {
            message = message.with_metadata("chatId", serde_json::Value::String(chat_id));
        }
        if let Some(name) = self.from.and_then(|f| f.user).and_then(|u| u.display_name) {
            message = message.with_metadata("from", serde_json::Value::String(name));
        }
        Some(message)
    }
}

/// Teams adapter.
pub struct TeamsSource {
    config: AdapterConfig,
    credentials: Arc<dyn CredentialStore>,
    client: reqwest::Client,
    base_url: String,
    state: SessionState,
}

impl TeamsSource {
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
}

#[async_trait]
impl MessageSource for TeamsSource {
    fn source(&self) -> Source {
        Source::Teams
    }

    async fn initialize(&self) -> Result<(), SourceError> {
        let token = load_token(self.credentials.as_ref(), &self.config.user_id, Source::Teams).await?;

        let resp = self
            .client
            .get(format!("{}/me", self.base_url))
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error(Source::Teams, e))?;
        let me: Me = decode(Source::Teams, check_status(Source::Teams, resp).await?).await?;

        let account = me.user_principal_name.or(me.display_name);
        info!(user_id = %self.config.user_id, account = ?account, "Teams connected");
        self.state.connect(token, account).await;
        Ok(())
    }

    async fn fetch_messages(
        &self,
        filter: &FetchFilter,
    ) -> Result<Vec<MessageContent>, SourceError> {
        let token = self.state.token(Source::Teams).await?;
        if filter.unread_only {
            // Graph exposes no per-message read state for chats.
            debug!(user_id = %self.config.user_id, "Teams ignores unreadOnly");
        }

        let mut query = vec![("$top", filter.effective_limit().to_string())];
        if let Some(f) = graph_filter(filter) {
            query.push(("$filter", f));
        }

        let resp = self
            .client
            .get(format!("{}/me/chats/getAllMessages", self.base_url))
            .bearer_auth(token.expose_secret())
            .query(&query)
            .send()
            .await
            .map_err(|e| transport_error(Source::Teams, e))?;
        let page: Page = decode(Source::Teams, check_status(Source::Teams, resp).await?).await?;

        let messages: Vec<MessageContent> = page
            .value
            .into_iter()
            .filter_map(|m| m.into_content(&self.config.user_id))
            .collect();

        let messages = apply_window(messages, filter);
        self.state.record_sync(messages.len()).await;
        debug!(count = messages.len(), "Fetched Teams messages");
        Ok(messages)
    }

    async fn metadata(&self) -> SourceMetadata {
        self.state.snapshot().await
    }

    async fn disconnect(&self) {
        self.state.disconnect().await;
    }
}
