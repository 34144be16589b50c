pub mod dto;
pub mod errors;
pub mod handlers;

use axum::{routing::get, Router};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::db::queue::ReadingQueue;

use handlers::ApiDoc;

pub fn router(queue: ReadingQueue) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/relay/status", get(handlers::get_relay_status))
        .route("/readings/pending", get(handlers::get_pending_readings))
        .route("/readings/latest", get(handlers::get_latest_reading))
        .with_state(queue)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
