//! libSQL backend: implements the queue, settings, and credential stores.
//!
//! Lease bookkeeping is stored as integer milliseconds so `visible_after`
//! comparisons happen in SQL. Every mutation goes through `write_lock`: the
//! backend shares one connection, and an open transaction must not pick up
//! statements issued by another task.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    EnqueueOptions, EnqueueOutcome, FailOutcome, LeaseBatch, MAX_VISIBILITY_TIMEOUT,
    MessageContent, QueueItem, QueueStats, QueueStatus, Source,
};
use crate::queue::Backoff;
use crate::store::migrations;
use crate::store::traits::{CredentialStore, QueueStore, SettingsStore, StoredCredentials};

/// Error recorded on items whose worker never acknowledged the lease.
const LEASE_EXPIRED_ERROR: &str = "lease expired before acknowledgement";

/// Column order read by `row_to_item`.
const ITEM_COLUMNS: &str = "id, user_id, message_id, source, priority, status, retry_count, \
     max_retries, visibility_timeout_ms, visible_after, created_at, updated_at, leased_at, \
     completed_at, worker_id, payload, error, result, seq";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(if ms > 0 {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn duration_ms(d: std::time::Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// Read a millisecond column. SQLite turns overflowing integer arithmetic
/// into REAL, so those values are accepted and saturated.
fn get_ms(row: &libsql::Row, idx: i32) -> Result<Option<i64>, DatabaseError> {
    match row.get_value(idx).map_err(query_err("row parse"))? {
        libsql::Value::Null => Ok(None),
        libsql::Value::Integer(ms) => Ok(Some(ms)),
        libsql::Value::Real(ms) => Ok(Some(ms as i64)),
        other => Err(DatabaseError::Serialization(format!(
            "column {idx}: expected milliseconds, got {other:?}"
        ))),
    }
}

fn require_ms(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    get_ms(row, idx)?
        .ok_or_else(|| DatabaseError::Serialization(format!("column {idx}: unexpected NULL")))
}

/// Map a libsql Row (selected with `ITEM_COLUMNS`) to `(seq, QueueItem)`.
fn row_to_item(row: &libsql::Row) -> Result<(i64, QueueItem), DatabaseError> {
    let parse = query_err("row parse");

    let id_str: String = row.get(0).map_err(&parse)?;
    let source_str: String = row.get(3).map_err(&parse)?;
    let status_str: String = row.get(5).map_err(&parse)?;
    let payload_str: String = row.get(15).map_err(&parse)?;
    let result_str: Option<String> = row.get::<String>(17).ok();

    let payload: MessageContent = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("queue payload: {e}")))?;

    let item = QueueItem {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("queue item id: {e}")))?,
        user_id: row.get(1).map_err(&parse)?,
        message_id: row.get(2).map_err(&parse)?,
        source: source_str.parse().map_err(DatabaseError::Serialization)?,
        priority: row.get(4).map_err(&parse)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        retry_count: row.get::<i64>(6).map_err(&parse)?.max(0) as u32,
        max_retries: row.get::<i64>(7).map_err(&parse)?.max(0) as u32,
        visibility_timeout_ms: require_ms(row, 8)?.max(0) as u64,
        visible_after: from_ms(require_ms(row, 9)?),
        created_at: from_ms(require_ms(row, 10)?),
        updated_at: from_ms(require_ms(row, 11)?),
        leased_at: get_ms(row, 12)?.map(from_ms),
        completed_at: get_ms(row, 13)?.map(from_ms),
        worker_id: row.get::<String>(14).ok(),
        payload,
        error: row.get::<String>(16).ok(),
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
    };
    let seq: i64 = row.get(18).map_err(&parse)?;
    Ok((seq, item))
}

/// Drain a result set of `ITEM_COLUMNS` rows.
async fn collect_items(
    mut rows: libsql::Rows,
    op: &'static str,
) -> Result<Vec<(i64, QueueItem)>, DatabaseError> {
    let mut items = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        items.push(row_to_item(&row)?);
    }
    Ok(items)
}

fn without_seq(items: Vec<(i64, QueueItem)>) -> Vec<QueueItem> {
    items.into_iter().map(|(_, item)| item).collect()
}

/// Reap expired leases on `conn`. Caller holds the write lock.
///
/// Expired items keep their `visible_after`, which is already in the past,
/// so a re-queued item is immediately leasable again.
async fn reap_expired_on(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<QueueItem>, DatabaseError> {
    let now_ms = to_ms(now);

    let exhausted = conn
        .query(
            &format!(
                "UPDATE queue_items
                 SET status = 'failed', retry_count = retry_count + 1, error = ?2,
                     worker_id = NULL, completed_at = ?1, updated_at = ?1
                 WHERE status = 'processing' AND visible_after <= ?1
                   AND retry_count + 1 >= max_retries
                 RETURNING {ITEM_COLUMNS}"
            ),
            params![now_ms, LEASE_EXPIRED_ERROR],
        )
        .await
        .map_err(query_err("reap_expired"))?;
    let mut reaped = collect_items(exhausted, "reap_expired").await?;

    let requeued = conn
        .query(
            &format!(
                "UPDATE queue_items
                 SET status = 'pending', retry_count = retry_count + 1, error = ?2,
                     worker_id = NULL, updated_at = ?1
                 WHERE status = 'processing' AND visible_after <= ?1
                 RETURNING {ITEM_COLUMNS}"
            ),
            params![now_ms, LEASE_EXPIRED_ERROR],
        )
        .await
        .map_err(query_err("reap_expired"))?;
    reaped.extend(collect_items(requeued, "reap_expired").await?);

    if !reaped.is_empty() {
        warn!(count = reaped.len(), "Reaped expired leases");
    }
    Ok(without_seq(reaped))
}

// ── QueueStore ──────────────────────────────────────────────────────

#[async_trait]
impl QueueStore for LibSqlBackend {
    async fn enqueue(
        &self,
        payload: &MessageContent,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, DatabaseError> {
        payload.validate().map_err(DatabaseError::Constraint)?;
        options.validate().map_err(DatabaseError::Constraint)?;

        let payload_json = serde_json::to_string(payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let id = Uuid::new_v4();
        let now_ms = to_ms(now);
        let timeout_ms = duration_ms(options.visibility_timeout);

        let guard = self.write_lock.lock().await;
        let conn = self.conn();

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO queue_items (id, user_id, message_id, source, priority,
                    status, retry_count, max_retries, visibility_timeout_ms, visible_after,
                    created_at, updated_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?8, ?8, ?8, ?9)",
                params![
                    id.to_string(),
                    payload.user_id.as_str(),
                    payload.source_id.as_str(),
                    payload.source.as_str(),
                    options.priority,
                    options.max_retries as i64,
                    timeout_ms,
                    now_ms,
                    payload_json,
                ],
            )
            .await
            .map_err(query_err("enqueue"))?;

        if inserted == 0 {
            let mut rows = conn
                .query(
                    "SELECT id FROM queue_items
                     WHERE user_id = ?1 AND source = ?2 AND message_id = ?3
                       AND status IN ('pending', 'processing', 'completed')
                     LIMIT 1",
                    params![
                        payload.user_id.as_str(),
                        payload.source.as_str(),
                        payload.source_id.as_str(),
                    ],
                )
                .await
                .map_err(query_err("enqueue dedup"))?;

            let row = rows
                .next()
                .await
                .map_err(query_err("enqueue dedup"))?
                .ok_or_else(|| {
                    DatabaseError::Constraint(format!(
                        "enqueue ignored without a live duplicate for {}",
                        payload.source_id
                    ))
                })?;
            let existing: String = row.get(0).map_err(query_err("enqueue dedup"))?;
            let existing_id = Uuid::parse_str(&existing)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

            debug!(
                user_id = %payload.user_id,
                source = %payload.source,
                message_id = %payload.source_id,
                existing_id = %existing_id,
                "Duplicate enqueue ignored"
            );
            return Ok(EnqueueOutcome::Duplicate { existing_id });
        }

        drop(guard);
        let item = self.get_item(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "queue_item".into(),
            id: id.to_string(),
        })?;
        debug!(
            item_id = %id,
            user_id = %item.user_id,
            priority = item.priority,
            "Item enqueued"
        );
        Ok(EnqueueOutcome::Enqueued(item))
    }

    async fn lease(
        &self,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<LeaseBatch, DatabaseError> {
        let now_ms = to_ms(now);
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("lease begin"))?;

        let reaped = reap_expired_on(&tx, now).await?;
        if batch_size == 0 {
            tx.commit().await.map_err(query_err("lease commit"))?;
            return Ok(LeaseBatch {
                leased: Vec::new(),
                reaped,
            });
        }

        let rows = tx
            .query(
                &format!(
                    "UPDATE queue_items
                     SET status = 'processing', worker_id = ?1, leased_at = ?2, updated_at = ?2,
                         visible_after = ?2 + MIN(MAX(visibility_timeout_ms, 1), ?4)
                     WHERE id IN (
                         SELECT id FROM queue_items
                         WHERE status = 'pending' AND visible_after <= ?2
                         ORDER BY priority DESC, created_at ASC, seq ASC
                         LIMIT ?3
                     )
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![
                    worker_id,
                    now_ms,
                    batch_size.min(i64::MAX as usize) as i64,
                    duration_ms(MAX_VISIBILITY_TIMEOUT),
                ],
            )
            .await
            .map_err(query_err("lease"))?;
        let mut leased = collect_items(rows, "lease").await?;

        tx.commit().await.map_err(query_err("lease commit"))?;

        // RETURNING order is unspecified.
        leased.sort_by(|(seq_a, a), (seq_b, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(seq_a.cmp(seq_b))
        });

        if !leased.is_empty() {
            debug!(worker_id, count = leased.len(), "Leased queue items");
        }
        Ok(LeaseBatch {
            leased: without_seq(leased),
            reaped,
        })
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let result_json = result
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now_ms = to_ms(now);

        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE queue_items
                 SET status = 'completed', error = NULL, result = ?2, worker_id = NULL,
                     completed_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND status = 'processing' AND worker_id = ?4",
                params![
                    id.to_string(),
                    opt_text(result_json.as_deref()),
                    now_ms,
                    worker_id
                ],
            )
            .await
            .map_err(query_err("complete"))?;

        if count == 0 {
            warn!(item_id = %id, worker_id, "Complete ignored, lease not held");
        }
        Ok(count > 0)
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, DatabaseError> {
        let now_ms = to_ms(now);
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("fail begin"))?;

        let mut rows = tx
            .query(
                "SELECT status, retry_count, max_retries, worker_id FROM queue_items
                 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("fail"))?;
        let Some(row) = rows.next().await.map_err(query_err("fail"))? else {
            return Ok(FailOutcome::NotLeased);
        };
        let status: QueueStatus = row
            .get::<String>(0)
            .map_err(query_err("fail"))?
            .parse()
            .map_err(DatabaseError::Serialization)?;
        let retry_count: i64 = row.get(1).map_err(query_err("fail"))?;
        let max_retries: i64 = row.get(2).map_err(query_err("fail"))?;
        let holder: Option<String> = row.get::<String>(3).ok();
        drop(rows);

        let attempts = retry_count + 1;
        let exhausted = attempts >= max_retries;
        let target = if exhausted {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        };

        if !status.can_transition_to(target) || holder.as_deref() != Some(worker_id) {
            warn!(
                item_id = %id,
                status = %status,
                worker_id,
                holder = holder.as_deref().unwrap_or("-"),
                "Fail ignored, lease not held"
            );
            return Ok(FailOutcome::NotLeased);
        }

        let rows = (if exhausted {
            tx.query(
                &format!(
                    "UPDATE queue_items
                     SET status = 'failed', retry_count = ?2, error = ?3, worker_id = NULL,
                         completed_at = ?4, updated_at = ?4
                     WHERE id = ?1
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![id.to_string(), attempts, error, now_ms],
            )
            .await
        } else {
            let delay = backoff.delay(attempts.clamp(0, u32::MAX as i64) as u32);
            let visible_after = now_ms.saturating_add(duration_ms(delay));
            tx.query(
                &format!(
                    "UPDATE queue_items
                     SET status = 'pending', retry_count = ?2, error = ?3, worker_id = NULL,
                         visible_after = ?5, updated_at = ?4
                     WHERE id = ?1
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![id.to_string(), attempts, error, now_ms, visible_after],
            )
            .await
        })
        .map_err(query_err("fail"))?;

        let mut updated = without_seq(collect_items(rows, "fail").await?);
        tx.commit().await.map_err(query_err("fail commit"))?;

        let item = updated.pop().ok_or_else(|| DatabaseError::NotFound {
            entity: "queue_item".into(),
            id: id.to_string(),
        })?;

        if exhausted {
            warn!(item_id = %id, attempts, error, "Item failed permanently");
            Ok(FailOutcome::Exhausted(item))
        } else {
            debug!(
                item_id = %id,
                attempts,
                visible_after = %item.visible_after,
                "Item re-queued with backoff"
            );
            Ok(FailOutcome::Retrying(item))
        }
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let now_ms = to_ms(now);
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE queue_items
                 SET status = 'cancelled', completed_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), now_ms],
            )
            .await
            .map_err(query_err("cancel"))?;

        if count > 0 {
            info!(item_id = %id, "Item cancelled");
        }
        Ok(count > 0)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("reap begin"))?;
        let reaped = reap_expired_on(&tx, now).await?;
        tx.commit().await.map_err(query_err("reap commit"))?;
        Ok(reaped)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<QueueItem>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_item"))?;
        Ok(without_seq(collect_items(rows, "get_item").await?).pop())
    }

    async fn list_items(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<QueueItem>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM queue_items WHERE user_id = ?1
                     ORDER BY created_at DESC, seq DESC LIMIT ?2"
                ),
                params![user_id, limit.min(i64::MAX as usize) as i64],
            )
            .await
            .map_err(query_err("list_items"))?;
        Ok(without_seq(collect_items(rows, "list_items").await?))
    }

    async fn stats(&self) -> Result<QueueStats, DatabaseError> {
        let conn = self.conn();
        let mut stats = QueueStats::default();

        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM queue_items GROUP BY status",
                (),
            )
            .await
            .map_err(query_err("stats"))?;
        while let Some(row) = rows.next().await.map_err(query_err("stats"))? {
            let status: String = row.get(0).map_err(query_err("stats"))?;
            let count = row.get::<i64>(1).map_err(query_err("stats"))?.max(0) as u64;
            match status.parse::<QueueStatus>() {
                Ok(QueueStatus::Pending) => stats.pending_count = count,
                Ok(QueueStatus::Processing) => stats.processing_count = count,
                Ok(QueueStatus::Completed) => stats.total_processed = count,
                Ok(QueueStatus::Failed) => stats.total_failed = count,
                Ok(QueueStatus::Cancelled) => {}
                Err(e) => warn!(error = %e, "Skipping unknown status in stats"),
            }
            stats.by_status.insert(status, count);
        }

        let mut rows = conn
            .query(
                "SELECT AVG(completed_at - leased_at) FROM queue_items
                 WHERE status = 'completed' AND leased_at IS NOT NULL AND completed_at IS NOT NULL",
                (),
            )
            .await
            .map_err(query_err("stats"))?;
        if let Some(row) = rows.next().await.map_err(query_err("stats"))? {
            stats.average_processing_time_ms = row.get::<f64>(0).ok();
        }

        Ok(stats)
    }

    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "DELETE FROM queue_items
                 WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < ?1",
                params![to_ms(older_than)],
            )
            .await
            .map_err(query_err("prune_terminal"))?;

        if count > 0 {
            info!(count, "Pruned terminal queue items");
        }
        Ok(count as usize)
    }
}

// ── SettingsStore ───────────────────────────────────────────────────

#[async_trait]
impl SettingsStore for LibSqlBackend {
    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
            )
            .await
            .map_err(query_err("get_setting"))?;

        let Some(row) = rows.next().await.map_err(query_err("get_setting"))? else {
            return Ok(None);
        };
        let value_str: String = row.get(0).map_err(query_err("get_setting"))?;
        let value = serde_json::from_str(&value_str)
            .map_err(|e| DatabaseError::Serialization(format!("setting {key}: {e}")))?;
        Ok(Some(value))
    }

    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO settings (user_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (user_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
                params![user_id, key, value_str, now],
            )
            .await
            .map_err(query_err("set_setting"))?;

        Ok(())
    }
}

// ── CredentialStore ─────────────────────────────────────────────────

#[async_trait]
impl CredentialStore for LibSqlBackend {
    async fn get_credentials(
        &self,
        user_id: &str,
        source: Source,
    ) -> Result<Option<StoredCredentials>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT access_token, refresh_token, expires_at FROM credentials
                 WHERE user_id = ?1 AND source = ?2",
                params![user_id, source.as_str()],
            )
            .await
            .map_err(query_err("get_credentials"))?;

        let Some(row) = rows.next().await.map_err(query_err("get_credentials"))? else {
            return Ok(None);
        };
        let access_token: String = row.get(0).map_err(query_err("get_credentials"))?;
        let refresh_token: Option<String> = row.get::<String>(1).ok();
        let expires_at: Option<String> = row.get::<String>(2).ok();

        Ok(Some(StoredCredentials {
            access_token: SecretString::from(access_token),
            refresh_token: refresh_token.map(SecretString::from),
            expires_at: expires_at.as_deref().and_then(parse_datetime),
        }))
    }

    async fn save_credentials(
        &self,
        user_id: &str,
        source: Source,
        credentials: &StoredCredentials,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let refresh = credentials
            .refresh_token
            .as_ref()
            .map(|t| t.expose_secret().to_string());
        let expires = credentials.expires_at.map(|t| t.to_rfc3339());

        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO credentials (user_id, source, access_token, refresh_token, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id, source) DO UPDATE SET
                    access_token = ?3, refresh_token = ?4, expires_at = ?5, updated_at = ?6",
                params![
                    user_id,
                    source.as_str(),
                    credentials.access_token.expose_secret(),
                    opt_text(refresh.as_deref()),
                    opt_text(expires.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(query_err("save_credentials"))?;

        debug!(user_id, source = %source, "Credentials saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    fn message(user: &str, source_id: &str) -> MessageContent {
        MessageContent::new(user, Source::Gmail, source_id, "hello there", t0())
            .with_subject("Hi")
    }

    fn opts(priority: i64, max_retries: u32) -> EnqueueOptions {
        EnqueueOptions {
            priority,
            max_retries,
            visibility_timeout: Duration::from_secs(30),
        }
    }

    fn fixed_backoff() -> Backoff {
        Backoff::new(Duration::from_secs(2), Duration::from_secs(60)).without_jitter()
    }

    async fn enqueue(db: &LibSqlBackend, msg: &MessageContent, o: EnqueueOptions, at: DateTime<Utc>) -> QueueItem {
        match db.enqueue(msg, o, at).await.unwrap() {
            EnqueueOutcome::Enqueued(item) => item,
            EnqueueOutcome::Duplicate { .. } => panic!("unexpected duplicate"),
        }
    }

    // ── enqueue ─────────────────────────────────────────────────

    #[tokio::test]
    async fn enqueue_creates_pending_item() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "m1"), opts(5, 3), t0()).await;

        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.user_id, "u1");
        assert_eq!(item.message_id, "m1");
        assert_eq!(item.source, Source::Gmail);
        assert_eq!(item.priority, 5);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.max_retries, 3);
        assert_eq!(item.visible_after, t0());
        assert_eq!(item.payload.subject.as_deref(), Some("Hi"));
        assert!(item.error.is_none());
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_while_live() {
        let db = test_db().await;
        let msg = message("u1", "m1");
        let first = enqueue(&db, &msg, opts(0, 3), t0()).await;

        let again = db.enqueue(&msg, opts(9, 3), t0() + secs(1)).await.unwrap();
        assert!(again.is_duplicate());
        assert_eq!(again.item_id(), first.id);

        // Still a duplicate while processing.
        db.lease("w1", 1, t0() + secs(2)).await.unwrap();
        assert!(db.enqueue(&msg, opts(0, 3), t0() + secs(3)).await.unwrap().is_duplicate());

        assert_eq!(db.stats().await.unwrap().by_status.values().sum::<u64>(), 1);
    }

    #[tokio::test]
    async fn same_source_id_for_other_user_or_source_is_distinct() {
        let db = test_db().await;
        enqueue(&db, &message("u1", "m1"), opts(0, 3), t0()).await;
        enqueue(&db, &message("u2", "m1"), opts(0, 3), t0()).await;

        let mut slack = message("u1", "m1");
        slack.source = Source::Slack;
        enqueue(&db, &slack, opts(0, 3), t0()).await;

        assert_eq!(db.stats().await.unwrap().pending_count, 3);
    }

    #[tokio::test]
    async fn completed_message_is_not_requeued() {
        let db = test_db().await;
        let msg = message("u1", "m1");
        let item = enqueue(&db, &msg, opts(0, 3), t0()).await;
        db.lease("w1", 1, t0()).await.unwrap();
        assert!(db.complete(item.id, "w1", None, t0() + secs(1)).await.unwrap());

        assert!(db.enqueue(&msg, opts(0, 3), t0() + secs(5)).await.unwrap().is_duplicate());
    }

    #[tokio::test]
    async fn cancelled_message_can_be_enqueued_again() {
        let db = test_db().await;
        let msg = message("u1", "m1");
        let item = enqueue(&db, &msg, opts(0, 3), t0()).await;
        assert!(db.cancel(item.id, t0()).await.unwrap());

        let again = db.enqueue(&msg, opts(0, 3), t0() + secs(1)).await.unwrap();
        assert!(!again.is_duplicate());
        assert_ne!(again.item_id(), item.id);
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_payload() {
        let db = test_db().await;
        let msg = message(" ", "m1");
        let err = db.enqueue(&msg, opts(0, 3), t0()).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    // ── lease ───────────────────────────────────────────────────

    #[tokio::test]
    async fn lease_prefers_higher_priority() {
        let db = test_db().await;
        enqueue(&db, &message("u1", "a"), opts(5, 3), t0()).await;
        let b = enqueue(&db, &message("u1", "b"), opts(10, 3), t0() + secs(1)).await;

        let leased = db.lease("w1", 1, t0() + secs(2)).await.unwrap().leased;
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, b.id);
        assert_eq!(leased[0].status, QueueStatus::Processing);
        assert_eq!(leased[0].worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn lease_is_fifo_within_priority() {
        let db = test_db().await;
        let first = enqueue(&db, &message("u1", "a"), opts(1, 3), t0()).await;
        let second = enqueue(&db, &message("u1", "b"), opts(1, 3), t0()).await;
        let third = enqueue(&db, &message("u1", "c"), opts(1, 3), t0() + secs(1)).await;

        let leased = db.lease("w1", 10, t0() + secs(2)).await.unwrap().leased;
        let ids: Vec<Uuid> = leased.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
    }

    #[tokio::test]
    async fn lease_sets_visibility_timeout() {
        let db = test_db().await;
        enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;

        let leased = db.lease("w1", 1, t0() + secs(1)).await.unwrap().leased;
        assert_eq!(leased[0].visible_after, t0() + secs(31));
        assert_eq!(leased[0].leased_at, Some(t0() + secs(1)));
        assert!(leased[0].lease_active(t0() + secs(30)));
        assert!(!leased[0].lease_active(t0() + secs(31)));
    }

    #[tokio::test]
    async fn leased_item_is_not_offered_to_second_worker() {
        let db = test_db().await;
        enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;

        assert_eq!(db.lease("w1", 5, t0()).await.unwrap().leased.len(), 1);
        assert!(db.lease("w2", 5, t0() + secs(29)).await.unwrap().leased.is_empty());
    }

    #[tokio::test]
    async fn lease_skips_items_not_yet_visible() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        db.lease("w1", 1, t0()).await.unwrap();
        db.fail(item.id, "w1", "boom", &fixed_backoff(), t0()).await.unwrap();

        assert!(db.lease("w1", 1, t0() + secs(1)).await.unwrap().leased.is_empty());
        assert_eq!(db.lease("w1", 1, t0() + secs(2)).await.unwrap().leased.len(), 1);
    }

    #[tokio::test]
    async fn lease_with_zero_batch_returns_nothing() {
        let db = test_db().await;
        enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        assert!(db.lease("w1", 0, t0()).await.unwrap().leased.is_empty());
        assert_eq!(db.stats().await.unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_released_with_retry_bumped() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;

        let first = db.lease("w1", 1, t0()).await.unwrap().leased;
        assert_eq!(first[0].id, item.id);

        let again = db.lease("w2", 1, t0() + secs(31)).await.unwrap();
        assert_eq!(again.reaped.len(), 1);
        assert_eq!(again.reaped[0].status, QueueStatus::Pending);
        assert_eq!(again.leased.len(), 1);
        assert_eq!(again.leased[0].id, item.id);
        assert_eq!(again.leased[0].retry_count, 1);
        assert_eq!(again.leased[0].worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn lease_reports_terminal_reaps() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "a"), opts(0, 1), t0()).await;
        db.lease("w1", 1, t0()).await.unwrap();

        let batch = db.lease("w2", 5, t0() + secs(30)).await.unwrap();
        assert!(batch.leased.is_empty());
        assert_eq!(batch.reaped.len(), 1);
        assert_eq!(batch.reaped[0].id, item.id);
        assert_eq!(batch.reaped[0].status, QueueStatus::Failed);
        assert_eq!(batch.reaped[0].error.as_deref(), Some(LEASE_EXPIRED_ERROR));

        // Already terminal: nothing left to reap.
        assert!(db.reap_expired(t0() + secs(60)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_leases_hand_out_each_item_once() {
        let db = Arc::new(test_db().await);
        for n in 0..20 {
            enqueue(&db, &message("u1", &format!("m{n}")), opts(0, 3), t0()).await;
        }

        let mut tasks = Vec::new();
        for w in 0..8 {
            let db = Arc::clone(&db);
            tasks.push(tokio::spawn(async move {
                let worker = format!("w{w}");
                let mut ids = Vec::new();
                loop {
                    let batch = db.lease(&worker, 3, t0() + secs(1)).await.unwrap();
                    if batch.leased.is_empty() {
                        return ids;
                    }
                    let held_by_me = |i: &QueueItem| i.worker_id.as_deref() == Some(&*worker);
                    assert!(batch.leased.iter().all(held_by_me));
                    ids.extend(batch.leased.into_iter().map(|i| i.id));
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let unique: std::collections::HashSet<Uuid> = all.iter().copied().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn enqueue_rejects_out_of_range_visibility_timeout() {
        let db = test_db().await;
        for timeout in [Duration::ZERO, Duration::from_secs(u64::MAX)] {
            let options = EnqueueOptions {
                visibility_timeout: timeout,
                ..opts(0, 3)
            };
            let err = db.enqueue(&message("u1", "a"), options, t0()).await.unwrap_err();
            assert!(matches!(err, DatabaseError::Constraint(_)), "{timeout:?}");
        }

        let at_max = EnqueueOptions {
            visibility_timeout: MAX_VISIBILITY_TIMEOUT,
            ..opts(0, 3)
        };
        enqueue(&db, &message("u1", "b"), at_max, t0()).await;
        let leased = db.lease("w1", 10, t0()).await.unwrap().leased;
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].visible_after, t0() + secs(24 * 60 * 60));
    }

    #[tokio::test]
    async fn real_valued_visible_after_is_read_back() {
        let db = test_db().await;
        let stuck = enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        let other = enqueue(&db, &message("u1", "b"), opts(0, 3), t0() + secs(1)).await;
        db.lease("w1", 1, t0()).await.unwrap();

        // What SQLite stores after integer overflow.
        db.conn()
            .execute(
                "UPDATE queue_items SET visible_after = 1.0e19 WHERE id = ?1",
                params![stuck.id.to_string()],
            )
            .await
            .unwrap();

        let item = db.get_item(stuck.id).await.unwrap().unwrap();
        assert_eq!(item.visible_after, DateTime::<Utc>::MAX_UTC);

        let batch = db.lease("w2", 10, t0() + secs(60)).await.unwrap();
        assert!(batch.reaped.is_empty());
        assert_eq!(batch.leased.len(), 1);
        assert_eq!(batch.leased[0].id, other.id);
    }

    // ── complete / fail ─────────────────────────────────────────

    #[tokio::test]
    async fn complete_stores_result_and_clears_error() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        db.lease("w1", 1, t0()).await.unwrap();
        db.fail(item.id, "w1", "transient", &fixed_backoff(), t0()).await.unwrap();
        db.lease("w1", 1, t0() + secs(2)).await.unwrap();

        let result = serde_json::json!({"summary": "ok"});
        assert!(db.complete(item.id, "w1", Some(&result), t0() + secs(3)).await.unwrap());

        let done = db.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
        assert!(done.error.is_none());
        assert!(done.worker_id.is_none());
        assert_eq!(done.result, Some(result));
        assert_eq!(done.completed_at, Some(t0() + secs(3)));
        assert_eq!(done.updated_at, t0() + secs(3));
    }

    #[tokio::test]
    async fn complete_requires_processing() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        assert!(!db.complete(item.id, "w1", None, t0()).await.unwrap());
        assert!(!db.complete(Uuid::new_v4(), "w1", None, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn fail_until_exhausted() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "a"), opts(0, 2), t0()).await;
        let backoff = fixed_backoff();

        db.lease("w1", 1, t0()).await.unwrap();
        let first = db.fail(item.id, "w1", "boom 1", &backoff, t0()).await.unwrap();
        let FailOutcome::Retrying(retrying) = first else {
            panic!("expected retry");
        };
        assert_eq!(retrying.status, QueueStatus::Pending);
        assert_eq!(retrying.retry_count, 1);
        assert_eq!(retrying.visible_after, t0() + secs(2));
        assert_eq!(retrying.error.as_deref(), Some("boom 1"));

        db.lease("w1", 1, t0() + secs(2)).await.unwrap();
        let second = db.fail(item.id, "w1", "boom 2", &backoff, t0() + secs(2)).await.unwrap();
        let FailOutcome::Exhausted(failed) = second else {
            panic!("expected exhaustion");
        };
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.error.as_deref(), Some("boom 2"));

        assert!(db.lease("w1", 1, t0() + secs(3600)).await.unwrap().leased.is_empty());
    }

    #[tokio::test]
    async fn visible_after_increases_with_each_failure() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "a"), opts(0, 5), t0()).await;
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(600));

        let mut now = t0();
        let mut last_visible = t0();
        for _ in 0..4 {
            let leased = db.lease("w1", 1, now).await.unwrap().leased;
            assert_eq!(leased.len(), 1);
            let outcome = db.fail(item.id, "w1", "x", &backoff, now).await.unwrap();
            let FailOutcome::Retrying(item) = outcome else {
                panic!("expected retry");
            };
            assert!(item.visible_after > last_visible);
            last_visible = item.visible_after;
            now = item.visible_after;
        }
    }

    #[tokio::test]
    async fn stale_worker_cannot_settle_a_released_lease() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        db.lease("w1", 1, t0()).await.unwrap();
        assert_eq!(db.lease("w2", 1, t0() + secs(31)).await.unwrap().leased.len(), 1);

        let outcome = db
            .fail(item.id, "w1", "late", &fixed_backoff(), t0() + secs(32))
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::NotLeased));
        assert!(!db.complete(item.id, "w1", None, t0() + secs(32)).await.unwrap());

        // w2 still holds the item.
        let held = db.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(held.status, QueueStatus::Processing);
        assert_eq!(held.worker_id.as_deref(), Some("w2"));
        assert_eq!(held.visible_after, t0() + secs(61));
        assert!(db.lease("w3", 1, t0() + secs(33)).await.unwrap().leased.is_empty());

        assert!(db.complete(item.id, "w2", None, t0() + secs(34)).await.unwrap());
    }

    #[tokio::test]
    async fn fail_on_pending_item_is_ignored() {
        let db = test_db().await;
        let item = enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        let outcome = db.fail(item.id, "w1", "x", &fixed_backoff(), t0()).await.unwrap();
        assert!(matches!(outcome, FailOutcome::NotLeased));
        assert_eq!(db.get_item(item.id).await.unwrap().unwrap().retry_count, 0);
    }

    // ── cancel / reap / stats / prune ───────────────────────────

    #[tokio::test]
    async fn cancel_only_applies_to_pending() {
        let db = test_db().await;
        let a = enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        let b = enqueue(&db, &message("u1", "b"), opts(0, 3), t0()).await;
        db.lease("w1", 1, t0()).await.unwrap();

        // `a` is processing now (FIFO), `b` still pending.
        assert!(!db.cancel(a.id, t0()).await.unwrap());
        assert!(db.cancel(b.id, t0()).await.unwrap());
        assert!(!db.cancel(b.id, t0()).await.unwrap());

        assert!(db.lease("w1", 5, t0() + secs(1)).await.unwrap().leased.is_empty());
        assert_eq!(
            db.get_item(b.id).await.unwrap().unwrap().status,
            QueueStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn reap_expired_fails_items_out_of_retries() {
        let db = test_db().await;
        let once = enqueue(&db, &message("u1", "a"), opts(0, 1), t0()).await;
        let twice = enqueue(&db, &message("u1", "b"), opts(0, 2), t0()).await;
        db.lease("w1", 2, t0()).await.unwrap();

        assert!(db.reap_expired(t0() + secs(10)).await.unwrap().is_empty());

        let reaped = db.reap_expired(t0() + secs(30)).await.unwrap();
        assert_eq!(reaped.len(), 2);

        let once = db.get_item(once.id).await.unwrap().unwrap();
        assert_eq!(once.status, QueueStatus::Failed);
        assert_eq!(once.error.as_deref(), Some(LEASE_EXPIRED_ERROR));

        let twice = db.get_item(twice.id).await.unwrap().unwrap();
        assert_eq!(twice.status, QueueStatus::Pending);
        assert_eq!(twice.retry_count, 1);
        assert!(twice.worker_id.is_none());
    }

    #[tokio::test]
    async fn stats_report_counts_and_throughput() {
        let db = test_db().await;
        let a = enqueue(&db, &message("u1", "a"), opts(0, 1), t0()).await;
        let b = enqueue(&db, &message("u1", "b"), opts(0, 1), t0()).await;
        enqueue(&db, &message("u1", "c"), opts(0, 1), t0()).await;
        enqueue(&db, &message("u1", "d"), opts(0, 1), t0()).await;

        db.lease("w1", 3, t0()).await.unwrap();
        db.complete(a.id, "w1", None, t0() + secs(4)).await.unwrap();
        db.fail(b.id, "w1", "nope", &fixed_backoff(), t0()).await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.processing_count, 1);
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.average_processing_time_ms, Some(4000.0));
    }

    #[tokio::test]
    async fn stats_on_empty_queue() {
        let db = test_db().await;
        let stats = db.stats().await.unwrap();
        assert_eq!(stats, QueueStats::default());
    }

    #[tokio::test]
    async fn prune_terminal_keeps_live_items() {
        let db = test_db().await;
        let a = enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        let b = enqueue(&db, &message("u1", "b"), opts(0, 3), t0()).await;
        db.cancel(a.id, t0()).await.unwrap();

        let deleted = db.prune_terminal(t0() + secs(60)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(db.get_item(a.id).await.unwrap().is_none());
        assert!(db.get_item(b.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_items_newest_first_per_user() {
        let db = test_db().await;
        enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        let newer = enqueue(&db, &message("u1", "b"), opts(0, 3), t0() + secs(1)).await;
        enqueue(&db, &message("u2", "c"), opts(0, 3), t0()).await;

        let items = db.list_items("u1", 10).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, newer.id);
        assert_eq!(db.list_items("u1", 1).await.unwrap().len(), 1);
    }

    // ── settings / credentials ──────────────────────────────────

    #[tokio::test]
    async fn settings_roundtrip_and_overwrite() {
        let db = test_db().await;
        assert!(db.get_setting("u1", "processing").await.unwrap().is_none());

        db.set_setting("u1", "processing", &serde_json::json!({"voiceEnabled": true}))
            .await
            .unwrap();
        db.set_setting("u1", "processing", &serde_json::json!({"voiceEnabled": false}))
            .await
            .unwrap();

        let value = db.get_setting("u1", "processing").await.unwrap().unwrap();
        assert_eq!(value["voiceEnabled"], false);
        assert!(db.get_setting("u2", "processing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_setting_is_an_error() {
        let db = test_db().await;
        db.conn()
            .execute(
                "INSERT INTO settings (user_id, key, value, updated_at)
                 VALUES ('u1', 'processing', '{not json', '2026-03-01T12:00:00Z')",
                (),
            )
            .await
            .unwrap();

        let err = db.get_setting("u1", "processing").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
    }

    #[tokio::test]
    async fn credentials_roundtrip() {
        let db = test_db().await;
        assert!(db.get_credentials("u1", Source::Slack).await.unwrap().is_none());

        let mut creds = StoredCredentials::new("xoxp-1");
        creds.refresh_token = Some(SecretString::from("refresh".to_string()));
        creds.expires_at = Some(t0());
        db.save_credentials("u1", Source::Slack, &creds).await.unwrap();

        let loaded = db.get_credentials("u1", Source::Slack).await.unwrap().unwrap();
        assert_eq!(loaded.access_token.expose_secret(), "xoxp-1");
        assert_eq!(
            loaded.refresh_token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("refresh".to_string())
        );
        assert_eq!(loaded.expires_at, Some(t0()));
        assert!(loaded.is_expired(t0()));
        assert!(db.get_credentials("u1", Source::Gmail).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("relay.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        enqueue(&db, &message("u1", "a"), opts(0, 3), t0()).await;
        assert!(db_path.exists());
    }
}
