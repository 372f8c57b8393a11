//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `health` - Service health checks
//! - `connection` - Link status, device scanning, connect and disconnect
//! - `readings` - Current reading, history, trends and calendar
//! - `alerts` - Active danger alert
//! - `settings` - Alert toggles
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod alerts;
pub mod connection;
pub mod error;
pub mod health;
pub mod openapi;
pub mod readings;
pub mod settings;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};

// Re-export OpenAPI utilities for the gen-openapi binary
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /api
/// ├── /status            - Link and pipeline status
/// ├── /devices           - Device scanning
/// ├── /connect           - Connect to a mask
/// ├── /disconnect        - Disconnect
/// ├── /readings          - Current reading, history, trends, calendar, day
/// ├── /alerts            - Active danger alert
/// ├── /settings          - Alert toggles
/// └── /openapi.json      - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                // Link management
                .route("/status", get(connection::get_status))
                .route("/devices", get(connection::scan_devices))
                .route("/connect", post(connection::connect_device))
                .route("/disconnect", post(connection::disconnect_device))
                // Readings and derived views
                .nest("/readings", readings::router())
                // Danger alert
                .route("/alerts", get(alerts::get_alerts))
                // Alert toggles
                .nest("/settings", settings::router())
                // OpenAPI spec at /api/openapi.json
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                // The companion web app is served from another origin.
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
