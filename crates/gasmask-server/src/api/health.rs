//! Health check API endpoint.
//!
//! Provides a simple health check endpoint for monitoring and supervisors.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use gasmask_core::ConnectionState;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "connection": { "state": "connected" }
}))]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// State of the link to the mask.
    pub connection: ConnectionState,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
///
/// Returns basic service status information including version and the
/// state of the link to the mask.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns basic service status information. The service is \
        healthy whether or not a mask is connected.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let connection = state.read().await.manager.status().state;

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connection,
    })
}
