use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::routes::{fetch, health, series};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(title = "transfer-stats", description = "Transfer counter sampler"),
    paths(
        health::healthz_handler,
        series::list_series,
        series::clear_series,
        fetch::fetch_now,
        fetch::scheduler_status,
    ),
    components(schemas(
        health::HealthResponse,
        series::SeriesRow,
        series::SeriesResponse,
        series::ClearRequest,
        series::ClearResponse,
        fetch::FetchNowResponse,
        fetch::LastCycle,
        fetch::StatusResponse,
    )),
    tags(
        (name = "health"),
        (name = "series", description = "Stored samples and derived deltas"),
        (name = "fetch", description = "Fetch cycles and scheduler state"),
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to serialize openapi document");
        serde_json::Value::Null
    })
}

async fn openapi_handler() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_handler))
}
