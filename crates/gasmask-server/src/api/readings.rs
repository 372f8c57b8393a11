//! Readings API endpoints.
//!
//! Provides the current reading, the retention history and the views
//! derived from it (trends, calendar, per-day lists).

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use gasmask_core::trends::{self, CalendarDay, TrendSummary, TrendWindow};
use gasmask_core::{HistoryEntry, Reading};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Default number of days in the calendar.
const DEFAULT_CALENDAR_DAYS: u32 = 7;

/// Upper bound on calendar length.
const MAX_CALENDAR_DAYS: u32 = 31;

/// Creates the readings router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/current", get(get_current))
        .route("/history", get(get_history))
        .route("/trends", get(get_trends))
        .route("/calendar", get(get_calendar))
        .route("/day/{date}", get(get_day))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Retention history response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryResponse {
    /// Entries, most recent first.
    pub entries: Vec<HistoryEntry>,

    /// Maximum number of entries kept.
    #[schema(example = 30)]
    pub capacity: usize,
}

/// Trend query parameters.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TrendQuery {
    /// `week` (7 days, default) or `month` (30 days).
    pub window: Option<TrendWindow>,
}

/// Calendar query parameters.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CalendarQuery {
    /// Number of days ending today (1-31, default 7).
    pub days: Option<u32>,
}

/// Readings recorded on one local day.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DayResponse {
    /// The local date.
    #[schema(value_type = String, example = "2025-03-10")]
    pub date: NaiveDate,

    /// Time zone the day boundaries follow.
    #[schema(example = "Europe/Berlin")]
    pub timezone: String,

    /// Entries, most recent first.
    pub entries: Vec<HistoryEntry>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the current reading.
#[utoipa::path(
    get,
    path = "/api/readings/current",
    tag = "readings",
    operation_id = "getCurrentReading",
    summary = "Get the latest reading",
    description = "Returns the most recent accepted reading. It stays \
        available after the link drops.",
    responses(
        (status = 200, description = "Latest reading", body = Reading),
        (status = 404, description = "No reading received yet", body = ErrorResponse)
    )
)]
pub async fn get_current(State(state): State<SharedState>) -> ApiResult<Json<Reading>> {
    let current = state.read().await.retention.current();
    current
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no_reading", "No reading has been received yet"))
}

/// Get the retention history.
#[utoipa::path(
    get,
    path = "/api/readings/history",
    tag = "readings",
    operation_id = "getHistory",
    summary = "Get the reading history",
    description = "Returns the bounded, rate-limited history, most recent \
        first. Readings enter it a while after they arrive and at most one \
        every couple of minutes.",
    responses(
        (status = 200, description = "History retrieved", body = HistoryResponse)
    )
)]
pub async fn get_history(State(state): State<SharedState>) -> Json<HistoryResponse> {
    let state_guard = state.read().await;
    Json(HistoryResponse {
        entries: state_guard.retention.history(),
        capacity: state_guard.config.retention.capacity,
    })
}

/// Get per-gas maxima over a window.
#[utoipa::path(
    get,
    path = "/api/readings/trends",
    tag = "readings",
    operation_id = "getTrends",
    summary = "Get gas maxima per alert level",
    description = "For each gas, the highest value seen at each alert level \
        over the last week or month of history.",
    params(TrendQuery),
    responses(
        (status = 200, description = "Trend summary", body = TrendSummary)
    )
)]
pub async fn get_trends(
    State(state): State<SharedState>,
    Query(query): Query<TrendQuery>,
) -> Json<TrendSummary> {
    let state_guard = state.read().await;
    let history = state_guard.retention.history();
    Json(trends::level_maxima(
        &history,
        query.window.unwrap_or_default(),
        Utc::now().timestamp_millis(),
        &state_guard.config.thresholds,
    ))
}

/// Get the calendar.
#[utoipa::path(
    get,
    path = "/api/readings/calendar",
    tag = "readings",
    operation_id = "getCalendar",
    summary = "Get the reading calendar",
    description = "The last days ending today in the configured time zone, \
        oldest first, each with its weekday, peak alert level and entries.",
    params(CalendarQuery),
    responses(
        (status = 200, description = "Calendar days", body = [CalendarDay]),
        (status = 400, description = "Day count out of range", body = ErrorResponse)
    )
)]
pub async fn get_calendar(
    State(state): State<SharedState>,
    Query(query): Query<CalendarQuery>,
) -> ApiResult<Json<Vec<CalendarDay>>> {
    let days = query.days.unwrap_or(DEFAULT_CALENDAR_DAYS);
    if !(1..=MAX_CALENDAR_DAYS).contains(&days) {
        return Err(ApiError::bad_request(
            "invalid_day_count",
            format!("days must be between 1 and {MAX_CALENDAR_DAYS}"),
        ));
    }

    let state_guard = state.read().await;
    let tz = state_guard.config.system.timezone;
    let today = Utc::now().with_timezone(&tz).date_naive();
    let history = state_guard.retention.history();

    Ok(Json(trends::calendar(&history, today, tz, days)))
}

/// Get the readings of one day.
#[utoipa::path(
    get,
    path = "/api/readings/day/{date}",
    tag = "readings",
    operation_id = "getDay",
    summary = "Get the readings of one day",
    description = "History entries recorded on a local date (YYYY-MM-DD), \
        most recent first.",
    params(
        ("date" = String, Path, description = "Local date (YYYY-MM-DD)", example = "2025-03-10")
    ),
    responses(
        (status = 200, description = "Entries of the day", body = DayResponse),
        (status = 400, description = "Malformed date", body = ErrorResponse)
    )
)]
pub async fn get_day(
    State(state): State<SharedState>,
    Path(date): Path<String>,
) -> ApiResult<Json<DayResponse>> {
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| {
        ApiError::bad_request(
            "invalid_date",
            format!("'{date}' is not a date in YYYY-MM-DD format"),
        )
    })?;

    let state_guard = state.read().await;
    let tz = state_guard.config.system.timezone;
    let history = state_guard.retention.history();

    Ok(Json(DayResponse {
        date,
        timezone: tz.name().to_string(),
        entries: trends::readings_on(&history, date, tz),
    }))
}
