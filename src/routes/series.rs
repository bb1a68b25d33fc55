use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::services::deltas::{self, format_gb, DeltaRow};
use crate::state::AppState;
use crate::time::{format_local, format_local_schedule};

/// One stored sample with its derived figures, ready for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, utoipa::ToSchema)]
pub struct SeriesRow {
    pub timestamp: DateTime<Utc>,
    pub local_time: String,
    pub paid_bytes: i64,
    pub unpaid_bytes: i64,
    pub paid_gb: f64,
    pub paid_gb_display: String,
    pub unpaid_gb: f64,
    pub unpaid_gb_display: String,
    pub delta_unpaid_bytes: i64,
    pub delta_unpaid_gb: f64,
    pub delta_unpaid_gb_display: String,
}

impl SeriesRow {
    pub(crate) fn from_delta(row: &DeltaRow, tz: &Tz) -> Self {
        Self {
            timestamp: row.timestamp,
            local_time: format_local(row.timestamp, tz),
            paid_bytes: row.paid_bytes,
            unpaid_bytes: row.unpaid_bytes,
            paid_gb: row.paid_gb,
            paid_gb_display: format_gb(row.paid_gb),
            unpaid_gb: row.unpaid_gb,
            unpaid_gb_display: format_gb(row.unpaid_gb),
            delta_unpaid_bytes: row.delta_unpaid_bytes,
            delta_unpaid_gb: row.delta_unpaid_gb,
            delta_unpaid_gb_display: format_gb(row.delta_unpaid_gb),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SeriesResponse {
    pub rows: Vec<SeriesRow>,
    pub next_fetch_at: DateTime<Utc>,
    pub next_fetch_local: String,
}

#[derive(Debug, Clone, Default, Deserialize, utoipa::ToSchema)]
pub struct ClearRequest {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ClearResponse {
    pub removed: u64,
}

pub(crate) fn next_fetch_local(state: &AppState, at: DateTime<Utc>) -> String {
    format_local_schedule(at, &state.config.display_timezone)
}

#[utoipa::path(
    get,
    path = "/api/series",
    tag = "series",
    responses(
        (status = 200, description = "Stored samples with deltas, oldest first",
            body = SeriesResponse),
        (status = 500, description = "Series store could not be read")
    )
)]
pub(crate) async fn list_series(State(state): State<AppState>) -> AppResult<Json<SeriesResponse>> {
    let samples = state.store.read_all().await?;
    let tz = state.config.display_timezone;
    let rows = deltas::compute(&samples)
        .iter()
        .map(|row| SeriesRow::from_delta(row, &tz))
        .collect();
    let next_fetch_at = state.scheduler.next_fetch_at();
    Ok(Json(SeriesResponse {
        rows,
        next_fetch_local: next_fetch_local(&state, next_fetch_at),
        next_fetch_at,
    }))
}

#[utoipa::path(
    post,
    path = "/api/clear",
    tag = "series",
    request_body = ClearRequest,
    responses(
        (status = 200, description = "All samples deleted", body = ClearResponse),
        (status = 400, description = "Deletion was not confirmed")
    )
)]
pub(crate) async fn clear_series(
    State(state): State<AppState>,
    payload: Result<Json<ClearRequest>, JsonRejection>,
) -> AppResult<Json<ClearResponse>> {
    let confirmed = payload.map(|Json(body)| body.confirm).unwrap_or(false);
    if !confirmed {
        return Err(AppError::bad_request(
            "clearing the series is irreversible; send {\"confirm\": true}",
        ));
    }
    let removed = state.store.clear().await?;
    tracing::warn!(removed, "series cleared");
    Ok(Json(ClearResponse { removed }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/series", get(list_series))
        .route("/clear", post(clear_series))
}
