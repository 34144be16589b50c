use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use utoipa::OpenApi;

use super::{
    dto::{ReadingDto, RelayStatusDto},
    errors::AppError,
};
use crate::db::{models::ReadingStatus, queue::ReadingQueue};

const DEFAULT_PENDING_LIMIT: u32 = 100;

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Queue depth and delivery progress.
#[utoipa::path(
    get,
    path = "/relay/status",
    responses(
        (status = 200, description = "Pending and sent counts", body = RelayStatusDto),
        (status = 500, description = "Internal server error"),
    ),
    tag = "relay"
)]
pub async fn get_relay_status(
    State(queue): State<ReadingQueue>,
) -> Result<Json<RelayStatusDto>, AppError> {
    let stats = queue.stats().await?;
    Ok(Json(stats.into()))
}

/// Undelivered readings, oldest first, with the last delivery error of each.
#[utoipa::path(
    get,
    path = "/readings/pending",
    params(
        ("limit" = Option<u32>, Query, description = "Maximum number of readings (default 100)"),
    ),
    responses(
        (status = 200, description = "Pending readings", body = Vec<ReadingDto>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "readings"
)]
pub async fn get_pending_readings(
    State(queue): State<ReadingQueue>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<ReadingDto>>, AppError> {
    let rows = queue
        .list_pending_limited(params.limit.unwrap_or(DEFAULT_PENDING_LIMIT))
        .await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// The most recently captured reading, whether delivered or not.
#[utoipa::path(
    get,
    path = "/readings/latest",
    responses(
        (status = 200, description = "Latest reading, or null when the queue is empty", body = Option<ReadingDto>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "readings"
)]
pub async fn get_latest_reading(
    State(queue): State<ReadingQueue>,
) -> Result<Json<Option<ReadingDto>>, AppError> {
    let row = queue.latest().await?;
    Ok(Json(row.map(Into::into)))
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(get_relay_status, get_pending_readings, get_latest_reading, health),
    components(schemas(ReadingDto, RelayStatusDto, ReadingStatus)),
    tags(
        (name = "relay",    description = "Store-and-forward relay state"),
        (name = "readings", description = "Queued sensor readings"),
        (name = "system",   description = "System endpoints"),
    ),
    info(
        title = "Sensor Relay API",
        version = "0.1.0",
        description = "Read-only status API for the sensor telemetry relay"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum_test::TestServer;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Value;

    use crate::{
        api::router,
        db::{in_memory_pool, models::Reading, queue::ReadingQueue},
    };

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn setup() -> (TestServer, ReadingQueue) {
        let queue = ReadingQueue::new(in_memory_pool().await);
        let server = TestServer::new(router(queue.clone())).unwrap();
        (server, queue)
    }

    async fn insert_reading(queue: &ReadingQueue, device_id: &str, secs: i64) {
        queue
            .append(&Reading::pending(device_id, 20.0, 50.0, 1010.0, at(secs)))
            .await
            .unwrap();
    }

    // -----------------------------------------------------------------------
    // GET /relay/status
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn status_on_empty_queue() {
        let (server, _) = setup().await;
        let resp = server.get("/relay/status").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["pending"], 0);
        assert_eq!(body["sent"], 0);
        assert!(body["oldest_pending"].is_null());
    }

    #[tokio::test]
    async fn status_counts_pending_and_sent() {
        let (server, queue) = setup().await;
        insert_reading(&queue, "pi", 1).await;
        insert_reading(&queue, "pi", 2).await;
        queue.mark_sent("pi", at(1)).await.unwrap();

        let body: Value = server.get("/relay/status").await.json();
        assert_eq!(body["pending"], 1);
        assert_eq!(body["sent"], 1);
        assert_eq!(body["oldest_pending"], "1970-01-01T00:00:02Z");
    }

    // -----------------------------------------------------------------------
    // GET /readings/pending
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pending_lists_oldest_first_with_last_error() {
        let (server, queue) = setup().await;
        insert_reading(&queue, "pi", 5).await;
        insert_reading(&queue, "pi", 3).await;
        queue.mark_failed("pi", at(3), "timed out").await.unwrap();

        let resp = server.get("/readings/pending").await;
        resp.assert_status_ok();
        let body: Vec<Value> = resp.json();
        assert_eq!(body.len(), 2);
        assert_eq!(body[0]["captured_at"], "1970-01-01T00:00:03Z");
        assert_eq!(body[0]["last_error"], "timed out");
        assert_eq!(body[0]["status"], "pending");
        assert!(body[1]["last_error"].is_null());
    }

    #[tokio::test]
    async fn pending_honours_limit() {
        let (server, queue) = setup().await;
        for secs in 1..=4 {
            insert_reading(&queue, "pi", secs).await;
        }

        let body: Vec<Value> = server.get("/readings/pending?limit=3").await.json();
        assert_eq!(body.len(), 3);
    }

    // -----------------------------------------------------------------------
    // GET /readings/latest
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn latest_is_null_when_empty() {
        let (server, _) = setup().await;
        let resp = server.get("/readings/latest").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn latest_includes_sent_readings() {
        let (server, queue) = setup().await;
        insert_reading(&queue, "pi", 1).await;
        insert_reading(&queue, "pi", 2).await;
        queue.mark_sent("pi", at(2)).await.unwrap();

        let body: Value = server.get("/readings/latest").await.json();
        assert_eq!(body["captured_at"], "1970-01-01T00:00:02Z");
        assert_eq!(body["status"], "sent");
    }

    // -----------------------------------------------------------------------
    // GET /health, GET /api-docs/openapi.json
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_returns_ok() {
        let (server, _) = setup().await;
        let resp = server.get("/health").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn openapi_spec_is_served() {
        let (server, _) = setup().await;
        let resp = server.get("/api-docs/openapi.json").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["info"]["title"], "Sensor Relay API");
        assert!(body["paths"]["/relay/status"].is_object());
    }
}
