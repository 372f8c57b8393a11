//! OpenAPI specification generation for the gasmask API.
//!
//! The generated document is consumed by the companion app's client
//! generator and served at `/api/openapi.json`.

use axum::Json;
use gasmask_core::trends::{CalendarDay, LevelMaxima, TrendSummary, TrendWindow};
use gasmask_core::{
    AlertLevel, AlertPreferences, AlertSession, ConnectionState, ConnectionStatus,
    DeviceDescriptor, Gas, GasLevels, HistoryEntry, Reading, TransportKind,
};
use utoipa::OpenApi;

use super::alerts::AlertStatusResponse;
use super::connection::{ConnectRequest, ScanDevicesResponse, StatusResponse};
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::readings::{DayResponse, HistoryResponse};
use super::settings::UpdateSettingsRequest;

/// Serve the OpenAPI specification as JSON.
///
/// This endpoint is available at `/api/openapi.json` and returns the complete
/// OpenAPI 3.0 specification for the gasmask API.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as a pretty JSON string.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for gasmask.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "gasmask API",
        version = "0.1.0",
        description = r#"
# gasmask API

Live gas readings, history and danger alerts from a sensor-equipped gas mask.

## Overview

The daemon keeps a link to the mask (Bluetooth LE or the local network) and:

1. **Readings**: Decodes every sensor frame into LPG, methane, carbon monoxide and ammonia levels, each classified as normal, warning or danger
2. **History**: Keeps a bounded history (30 entries) that admits a reading ten minutes after it arrives and at most one every two minutes
3. **Alerts**: Opens an alert session while any gas is at danger level, with vibration, a spoken evacuation message and a single notification

## Connection lifecycle

`disconnected` → `scanning` (GET /api/devices) → `disconnected` → `connecting` (POST /api/connect) → `connected`.
A dropped link moves to `reconnecting` with exponential backoff and falls back to `disconnected` after five failed attempts.
POST /api/disconnect works in every state.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local gasmask daemon")
    ),
    tags(
        (
            name = "system",
            description = "Health checks"
        ),
        (
            name = "connection",
            description = "Link status, discovery, connect and disconnect"
        ),
        (
            name = "readings",
            description = "Current reading, history, trends and calendar"
        ),
        (
            name = "alerts",
            description = "Active danger alert"
        ),
        (
            name = "settings",
            description = "Alert and vibration toggles"
        )
    ),
    paths(
        // Health endpoints
        super::health::health_check,
        // Connection endpoints
        super::connection::get_status,
        super::connection::scan_devices,
        super::connection::connect_device,
        super::connection::disconnect_device,
        // Reading endpoints
        super::readings::get_current,
        super::readings::get_history,
        super::readings::get_trends,
        super::readings::get_calendar,
        super::readings::get_day,
        // Alert endpoints
        super::alerts::get_alerts,
        // Settings endpoints
        super::settings::get_settings,
        super::settings::update_settings,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Connection types
            StatusResponse,
            ScanDevicesResponse,
            ConnectRequest,
            ConnectionStatus,
            ConnectionState,
            DeviceDescriptor,
            TransportKind,
            // Reading types
            Reading,
            GasLevels,
            Gas,
            AlertLevel,
            HistoryEntry,
            HistoryResponse,
            TrendWindow,
            TrendSummary,
            LevelMaxima,
            CalendarDay,
            DayResponse,
            // Alert types
            AlertSession,
            AlertStatusResponse,
            // Settings types
            AlertPreferences,
            UpdateSettingsRequest,
        )
    )
)]
pub struct ApiDoc;
