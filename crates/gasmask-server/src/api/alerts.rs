//! Alert API endpoint.
//!
//! Exposes the open danger alert session, if any.

use axum::extract::State;
use axum::Json;
use gasmask_core::{evacuation_message, AlertSession};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Alert status response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "active": true,
    "session": {
        "id": "01956f4e-8a2b-7c3d-9e4f-5a6b7c8d9e0f",
        "gases_in_danger": ["carbon_monoxide"],
        "started_at": 1_744_000_000_000_i64,
        "notified": true,
        "effects_started": true
    },
    "message": "Danger! Dangerous levels of Carbon Monoxide detected. Evacuate the area immediately."
}))]
pub struct AlertStatusResponse {
    /// Whether a danger alert session is open.
    pub active: bool,

    /// The open session.
    pub session: Option<AlertSession>,

    /// Evacuation message of the open session.
    pub message: Option<String>,
}

/// Get the alert status.
#[utoipa::path(
    get,
    path = "/api/alerts",
    tag = "alerts",
    operation_id = "getAlerts",
    summary = "Get the active danger alert",
    description = "Returns the open alert session. A session opens when any \
        gas reaches danger level and closes on the first reading with no gas \
        at danger level.",
    responses(
        (status = 200, description = "Alert status", body = AlertStatusResponse)
    )
)]
pub async fn get_alerts(State(state): State<SharedState>) -> Json<AlertStatusResponse> {
    let session = state.read().await.alert_session.borrow().clone();

    Json(AlertStatusResponse {
        active: session.is_some(),
        message: session
            .as_ref()
            .map(|s| evacuation_message(&s.gases_in_danger)),
        session,
    })
}
