use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::routes::series::{next_fetch_local, SeriesRow};
use crate::services::deltas;
use crate::services::scheduler::{CycleResult, FetchError};
use crate::services::series_store::{Sample, StoreError};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct FetchNowResponse {
    /// `ok`, `busy` or `failed`.
    pub status: String,
    pub row: Option<SeriesRow>,
    pub kind: Option<String>,
    pub reason: Option<String>,
    pub next_fetch_at: DateTime<Utc>,
    pub next_fetch_local: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct LastCycle {
    pub trigger: String,
    pub finished_at: DateTime<Utc>,
    pub refreshed_token: bool,
    pub status: String,
    pub kind: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct StatusResponse {
    pub phase: String,
    pub last_cycle: Option<LastCycle>,
    pub sample_count: u64,
    pub interval_minutes: u32,
    pub schedule_timezone: String,
    pub next_fetch_at: DateTime<Utc>,
    pub next_fetch_local: String,
}

#[utoipa::path(
    post,
    path = "/api/fetch-now",
    tag = "fetch",
    responses(
        (status = 200, description = "Sample fetched and stored", body = FetchNowResponse),
        (status = 409, description = "A fetch cycle is already running",
            body = FetchNowResponse),
        (status = 502, description = "The fetch cycle failed; nothing was stored",
            body = FetchNowResponse)
    )
)]
pub(crate) async fn fetch_now(State(state): State<AppState>) -> Response {
    let result = state.scheduler.fetch_now().await;
    let next_fetch_at = state.scheduler.next_fetch_at();
    let mut body = FetchNowResponse {
        status: String::new(),
        row: None,
        kind: None,
        reason: None,
        next_fetch_at,
        next_fetch_local: next_fetch_local(&state, next_fetch_at),
    };
    let status = match result {
        Ok(sample) => {
            body.status = "ok".to_string();
            body.row = latest_row(&state, &sample).await;
            StatusCode::OK
        }
        Err(err) => {
            body.status = match err {
                FetchError::Busy => "busy",
                _ => "failed",
            }
            .to_string();
            body.kind = Some(err.kind().to_string());
            body.reason = Some(err.to_string());
            match err {
                FetchError::Busy => StatusCode::CONFLICT,
                _ => StatusCode::BAD_GATEWAY,
            }
        }
    };
    (status, Json(body)).into_response()
}

async fn latest_row(state: &AppState, sample: &Sample) -> Option<SeriesRow> {
    let series = state.store.read_all().await;
    row_for_sample(series, sample, &state.config.display_timezone)
}

/// Display row for a freshly stored sample, with its delta against the sample before it.
///
/// `None` when the series cannot be re-read or no longer ends with the sample (a concurrent
/// clear), since the delta would then be unknown.
fn row_for_sample(
    series: Result<Vec<Sample>, StoreError>,
    sample: &Sample,
    tz: &Tz,
) -> Option<SeriesRow> {
    let series = match series {
        Ok(series) => series,
        Err(err) => {
            tracing::warn!(error = %err, "failed to re-read series after fetch");
            return None;
        }
    };
    if series.last() != Some(sample) {
        tracing::debug!("fetched sample is no longer the newest row; omitting delta");
        return None;
    }
    deltas::compute(&series)
        .last()
        .map(|row| SeriesRow::from_delta(row, tz))
}

#[utoipa::path(
    get,
    path = "/api/status",
    tag = "fetch",
    responses((status = 200, description = "Scheduler state", body = StatusResponse))
)]
pub(crate) async fn scheduler_status(
    State(state): State<AppState>,
) -> AppResult<Json<StatusResponse>> {
    let status = state.scheduler.status();
    let sample_count = state.store.count().await?;
    let next_fetch_at = state.scheduler.next_fetch_at();
    let last_cycle = status.last_cycle.map(|report| {
        let (outcome, kind, reason) = match report.result {
            CycleResult::Ok { .. } => ("ok", None, None),
            CycleResult::Failed { kind, reason } => {
                ("failed", Some(kind.to_string()), Some(reason))
            }
        };
        LastCycle {
            trigger: report.trigger.as_str().to_string(),
            finished_at: report.finished_at,
            refreshed_token: report.refreshed_token,
            status: outcome.to_string(),
            kind,
            reason,
        }
    });
    Ok(Json(StatusResponse {
        phase: status.phase.as_str().to_string(),
        last_cycle,
        sample_count,
        interval_minutes: state.config.fetch_interval_minutes,
        schedule_timezone: state.config.schedule_timezone.name().to_string(),
        next_fetch_local: next_fetch_local(&state, next_fetch_at),
        next_fetch_at,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/fetch-now", post(fetch_now))
        .route("/status", get(scheduler_status))
}
