//! HTTP surface: queue REST endpoints, live event stream, and health.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::context::AppContext;
use crate::model::{EnqueueOptions, EnqueueOutcome, MessageContent};
use crate::monitor::Monitor;
use crate::push::event_stream;

/// Default and maximum page size for per-user listings.
const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Build the Axum router.
pub fn routes(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/queue", post(enqueue))
        .route("/api/queue/status", get(queue_status))
        .route("/api/queue/items/{id}", get(get_item))
        .route("/api/queue/items/{id}/cancel", post(cancel_item))
        .route("/api/users/{user_id}/items", get(list_user_items))
        .route("/api/events", get(events))
        .route("/api/monitors", get(monitors))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    error!(error = %e, "{context}");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
}

fn parse_item_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid item ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(ctx): State<AppContext>) -> impl IntoResponse {
    let healthy = ctx.monitors.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "inbox-relay",
            "monitors": ctx.monitors.len(),
        })),
    )
}

async fn monitors(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.monitors.status().await)
}

// ── Queue ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    #[serde(flatten)]
    message: MessageContent,
    priority: Option<i64>,
    max_retries: Option<u32>,
    visibility_timeout_secs: Option<u64>,
}

impl EnqueueRequest {
    fn options(&self, defaults: EnqueueOptions) -> EnqueueOptions {
        EnqueueOptions {
            priority: self.priority.unwrap_or(defaults.priority),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            visibility_timeout: self
                .visibility_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
        }
    }
}

async fn enqueue(
    State(ctx): State<AppContext>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.body_text()),
    };

    if let Err(reason) = body.message.validate() {
        return error_body(StatusCode::BAD_REQUEST, reason);
    }
    let options = body.options(ctx.enqueue_defaults);
    if let Err(reason) = options.validate() {
        return error_body(StatusCode::BAD_REQUEST, reason);
    }
    if options.visibility_timeout <= ctx.transform_timeout {
        return error_body(
            StatusCode::BAD_REQUEST,
            format!(
                "visibilityTimeoutSecs must exceed the transform timeout ({}s)",
                ctx.transform_timeout.as_secs_f64()
            ),
        );
    }

    match ctx.queue.enqueue(&body.message, options, Utc::now()).await {
        Ok(EnqueueOutcome::Enqueued(item)) => {
            info!(
                item_id = %item.id,
                user_id = %item.user_id,
                source = %item.source,
                "Message enqueued via API"
            );
            (
                StatusCode::CREATED,
                Json(json!({"itemId": item.id, "status": "enqueued"})),
            )
                .into_response()
        }
        Ok(EnqueueOutcome::Duplicate { existing_id }) => {
            debug!(item_id = %existing_id, "Duplicate enqueue via API");
            (
                StatusCode::OK,
                Json(json!({"itemId": existing_id, "status": "duplicate"})),
            )
                .into_response()
        }
        Err(e) => internal_error("Enqueue failed", e),
    }
}

async fn queue_status(State(ctx): State<AppContext>) -> Response {
    match ctx.queue.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error("Queue stats failed", e),
    }
}

async fn get_item(State(ctx): State<AppContext>, Path(id): Path<String>) -> Response {
    let item_id = match parse_item_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match ctx.queue.get_item(item_id).await {
        Ok(Some(item)) => Json(item).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Item not found"),
        Err(e) => internal_error("Item lookup failed", e),
    }
}

async fn cancel_item(State(ctx): State<AppContext>, Path(id): Path<String>) -> Response {
    let item_id = match parse_item_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match ctx.queue.cancel(item_id, Utc::now()).await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({"itemId": item_id, "status": "cancelled"})),
        )
            .into_response(),
        Ok(false) => match ctx.queue.get_item(item_id).await {
            Ok(Some(item)) => error_body(
                StatusCode::CONFLICT,
                format!("Item is {} and cannot be cancelled", item.status),
            ),
            Ok(None) => error_body(StatusCode::NOT_FOUND, "Item not found"),
            Err(e) => internal_error("Item lookup failed", e),
        },
        Err(e) => internal_error("Cancel failed", e),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_user_items(
    State(ctx): State<AppContext>,
    Path(user_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    match ctx.queue.list_items(&user_id, limit).await {
        Ok(items) => {
            let items: Vec<_> = items
                .into_iter()
                .map(|item| {
                    let message = item.message_view();
                    json!({ "item": item, "message": message })
                })
                .collect();
            Json(items).into_response()
        }
        Err(e) => internal_error("Item listing failed", e),
    }
}

// ── Live events ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EventsQuery {
    user_id: String,
}

async fn events(State(ctx): State<AppContext>, Query(query): Query<EventsQuery>) -> Response {
    if query.user_id.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "user_id is required");
    }
    event_stream(ctx.push.clone(), query.user_id).into_response()
}
