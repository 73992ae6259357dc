//! Gmail adapter: Gmail REST API v1 with a stored OAuth access token.

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

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    internal_date: Option<String>,
    payload: Option<GmailPayload>,
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    #[serde(default)]
    headers: Vec<GmailHeader>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

impl GmailMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.payload.as_ref().and_then(|p| {
            p.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        })
    }

    fn received_at(&self) -> DateTime<Utc> {
        self.internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }

    /// Normalize; `None` when there is no text to process.
    fn into_content(self, user_id: &str) -> Option<MessageContent> {
        let subject = self.header("Subject").map(str::to_string);
        let from = self.header("From").map(str::to_string);
        let timestamp = self.received_at();
        let unread = self.label_ids.iter().any(|l| l == "UNREAD");

        let body = if self.snippet.trim().is_empty() {
            subject.clone()?
        } else {
            self.snippet
        };

        let mut message = MessageContent::new(user_id, Source::Gmail, self.id, body, timestamp)
            .with_metadata("unread", serde_json::Value::Bool(unread))
            .with_metadata("labels", serde_json::json!(self.label_ids));
        if let Some(subject) = subject {
            message = message.with_subject(subject);
        }
        if let Some(from) = from {
            message = message.with_metadata("from", serde_json::Value::String(from));
        }
        if let Some(thread_id) = self.thread_id {
            message = message.with_metadata("threadId", serde_json::Value::String(thread_id));
        }
        Some(message)
    }
}

/// Gmail search query for a filter (`after:`/`before:` take epoch seconds).
fn search_query(filter: &FetchFilter) -> String {
    let mut terms = Vec::new();
    if let Some(since) = filter.since {
        terms.push(format!("after:{}", since.timestamp()));
    }
    if let Some(until) = filter.until {
        // `before:` is exclusive and second-granular; `apply_window` trims the overlap.
        terms.push(format!("before:{}", until.timestamp() + 1));
    }
    if filter.unread_only {
        terms.push("is:unread".to_string());
    }
    terms.join(" ")
}

/// Gmail adapter.
pub struct GmailSource {
    config: AdapterConfig,
    credentials: Arc<dyn CredentialStore>,
    client: reqwest::Client,
    base_url: String,
    state: SessionState,
}

impl GmailSource {
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

    fn api_url(&self, path: &str) -> String {
        format!("{}/gmail/v1/users/me/{path}", self.base_url)
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, SourceError> {
        let token = self.state.token(Source::Gmail).await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(Source::Gmail, e))?;
        check_status(Source::Gmail, resp).await
    }
}

#[async_trait]
impl MessageSource for GmailSource {
    fn source(&self) -> Source {
        Source::Gmail
    }

    async fn initialize(&self) -> Result<(), SourceError> {
        let token = load_token(self.credentials.as_ref(), &self.config.user_id, Source::Gmail).await?;

        let resp = self
            .client
            .get(self.api_url("profile"))
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error(Source::Gmail, e))?;
        let profile: Profile = decode(Source::Gmail, check_status(Source::Gmail, resp).await?).await?;

        info!(user_id = %self.config.user_id, account = ?profile.email_address, "Gmail connected");
        self.state.connect(token, profile.email_address).await;
        Ok(())
    }

    async fn fetch_messages(
        &self,
        filter: &FetchFilter,
    ) -> Result<Vec<MessageContent>, SourceError> {
        let limit = filter.effective_limit();
        let mut query = vec![("maxResults", limit.to_string())];
        let q = search_query(filter);
        if !q.is_empty() {
            query.push(("q", q));
        }

        let list: MessageList =
            decode(Source::Gmail, self.get(&self.api_url("messages"), &query).await?).await?;

        let mut messages = Vec::with_capacity(list.messages.len());
        for reference in list.messages.into_iter().take(limit) {
            let url = self.api_url(&format!("messages/{}", reference.id));
            let detail_query = [
                ("format", "metadata".to_string()),
                ("metadataHeaders", "Subject".to_string()),
                ("metadataHeaders", "From".to_string()),
            ];
            let detail: GmailMessage =
                decode(Source::Gmail, self.get(&url, &detail_query).await?).await?;

            match detail.into_content(&self.config.user_id) {
                Some(message) => messages.push(message),
                None => debug!(id = %reference.id, "Skipping Gmail message without text"),
            }
        }

        let messages = apply_window(messages, filter);
        self.state.record_sync(messages.len()).await;
        debug!(count = messages.len(), "Fetched Gmail messages");
        Ok(messages)
    }

    async fn metadata(&self) -> SourceMetadata {
        self.state.snapshot().await
    }

    async fn disconnect(&self) {
        if self.state.snapshot().await.connected {
            warn!(user_id = %self.config.user_id, "Gmail session closed");
        }
        self.state.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(json: serde_json::Value) -> GmailMessage {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn search_query_from_filter() {
        let since = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let filter = FetchFilter {
            since: Some(since),
            until: None,
            limit: None,
            unread_only: true,
        };
        assert_eq!(search_query(&filter), "after:1700000000 is:unread");
        assert_eq!(search_query(&FetchFilter::default()), "");

        let page_below = FetchFilter {
            until: DateTime::from_timestamp(1_700_000_500, 250_000_000),
            ..FetchFilter::default()
        };
        assert_eq!(search_query(&page_below), "before:1700000501");
    }

    #[test]
    fn message_normalizes_headers_and_date() {
        let msg = parsed(serde_json::json!({
            "id": "abc",
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "Lunch tomorrow?",
            "internalDate": "1700000000000",
            "payload": {"headers": [
                {"name": "Subject", "value": "Lunch"},
                {"name": "from", "value": "Ana <ana@example.com>"}
            ]}
        }));

        let content = msg.into_content("u1").unwrap();
        assert_eq!(content.source, Source::Gmail);
        assert_eq!(content.source_id, "abc");
        assert_eq!(content.subject.as_deref(), Some("Lunch"));
        assert_eq!(content.content, "Lunch tomorrow?");
        assert_eq!(content.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(content.metadata["from"], "Ana <ana@example.com>");
        assert_eq!(content.metadata["unread"], true);
        assert_eq!(content.metadata["threadId"], "t1");
    }

    #[test]
    fn empty_snippet_falls_back_to_subject() {
        let with_subject = parsed(serde_json::json!({
            "id": "a",
            "snippet": "",
            "payload": {"headers": [{"name": "Subject", "value": "Only a subject"}]}
        }));
        assert_eq!(with_subject.into_content("u1").unwrap().content, "Only a subject");

        let empty = parsed(serde_json::json!({"id": "b", "snippet": " "}));
        assert!(empty.into_content("u1").is_none());
    }
}
