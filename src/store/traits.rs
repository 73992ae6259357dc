//! Store traits: the async persistence seams used by the rest of the relay.
//!
//! `QueueStore` is the durable work queue; `SettingsStore` and
//! `CredentialStore` are the generic key/value collaborators. The libSQL
//! backend implements all three.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    EnqueueOptions, EnqueueOutcome, FailOutcome, LeaseBatch, MessageContent, QueueItem, QueueStats,
    Source,
};
use crate::queue::Backoff;

/// Durable, prioritized, retryable work queue with visibility-timeout leases.
///
/// All time-dependent operations take `now` explicitly so lease arithmetic
/// is deterministic under test.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a pending item for `payload`.
    ///
    /// No-op (returns `Duplicate`) if an item for the same
    /// `(user_id, source, source_id)` is pending, processing, or completed.
    /// Options failing `EnqueueOptions::validate` are a `Constraint` error.
    async fn enqueue(
        &self,
        payload: &MessageContent,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, DatabaseError>;

    /// Atomically lease up to `batch_size` visible pending items, highest
    /// priority first, oldest first within a priority.
    ///
    /// Expired leases are reaped first in the same transaction, so an item
    /// whose worker vanished is offered again with its retry count bumped.
    /// The reaped items come back in `LeaseBatch::reaped`.
    async fn lease(
        &self,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<LeaseBatch, DatabaseError>;

    /// Mark an item completed. Returns `false` unless it is processing under
    /// a lease held by `worker_id`.
    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Record a failed attempt on an item leased by `worker_id`.
    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, DatabaseError>;

    /// Cancel a pending item. Returns `false` if it was not pending.
    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Treat processing items whose lease expired as failed attempts.
    /// Returns the affected items in their new state.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>, DatabaseError>;

    async fn get_item(&self, id: Uuid) -> Result<Option<QueueItem>, DatabaseError>;

    /// Most recent items for one user, newest first.
    async fn list_items(&self, user_id: &str, limit: usize)
    -> Result<Vec<QueueItem>, DatabaseError>;

    async fn stats(&self) -> Result<QueueStats, DatabaseError>;

    /// Delete terminal items last updated before `older_than`.
    /// Returns the number of items deleted.
    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError>;
}

/// Per-user JSON settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;
}

/// Provider tokens for one user/source pair, written by the OAuth flow.
#[derive(Debug)]
pub struct StoredCredentials {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredCredentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Credential lookup keyed by user.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credentials(
        &self,
        user_id: &str,
        source: Source,
    ) -> Result<Option<StoredCredentials>, DatabaseError>;

    async fn save_credentials(
        &self,
        user_id: &str,
        source: Source,
        credentials: &StoredCredentials,
    ) -> Result<(), DatabaseError>;
}
