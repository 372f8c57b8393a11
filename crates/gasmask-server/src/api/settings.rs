//! Settings API endpoints.
//!
//! Provides endpoints for reading and updating the alert toggles. Changes
//! reach the alert dispatcher immediately and are written to the
//! configuration file.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use gasmask_core::AlertPreferences;
use serde::Deserialize;
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the settings router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(get_settings).put(update_settings))
}

/// Request to update alert toggles. Omitted fields keep their value.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[schema(example = json!({
    "alerts_enabled": true,
    "vibration_enabled": false
}))]
pub struct UpdateSettingsRequest {
    /// Whether danger alerts fire side effects.
    #[schema(example = true)]
    pub alerts_enabled: Option<bool>,

    /// Whether danger alerts vibrate.
    #[schema(example = false)]
    pub vibration_enabled: Option<bool>,
}

/// Get alert settings.
#[utoipa::path(
    get,
    path = "/api/settings",
    tag = "settings",
    operation_id = "getSettings",
    summary = "Get alert settings",
    description = "Returns the alert toggles. When alerts are disabled \
        readings are still classified but no vibration, speech or \
        notification happens.",
    responses(
        (status = 200, description = "Settings retrieved", body = AlertPreferences)
    )
)]
pub async fn get_settings(State(state): State<SharedState>) -> Json<AlertPreferences> {
    Json(state.read().await.config.alerts)
}

/// Update alert settings.
#[utoipa::path(
    put,
    path = "/api/settings",
    tag = "settings",
    operation_id = "updateSettings",
    summary = "Update alert settings",
    description = "Updates the alert toggles. Disabling alerts during an \
        active danger alert stops its vibration and speech right away; \
        enabling them starts effects on the next danger reading. When the \
        configuration cannot be saved nothing changes.",
    request_body = UpdateSettingsRequest,
    responses(
        (status = 200, description = "Settings updated", body = AlertPreferences),
        (status = 500, description = "Settings could not be saved", body = ErrorResponse)
    )
)]
pub async fn update_settings(
    State(state): State<SharedState>,
    Json(request): Json<UpdateSettingsRequest>,
) -> ApiResult<Json<AlertPreferences>> {
    let mut state_guard = state.write().await;

    let mut config = state_guard.config.clone();
    if let Some(enabled) = request.alerts_enabled {
        config.alerts.alerts_enabled = enabled;
    }
    if let Some(enabled) = request.vibration_enabled {
        config.alerts.vibration_enabled = enabled;
    }

    let preferences = config.alerts;
    state_guard
        .commit_config(config)
        .map_err(|e| ApiError::InternalError {
            error_code: "config_save_failed".to_string(),
            message: "Failed to save configuration".to_string(),
            details: Some(e.to_string()),
        })?;

    // The dispatcher only hears about toggles that were saved.
    state_guard.preferences.send_replace(preferences);
    info!(
        alerts_enabled = preferences.alerts_enabled,
        vibration_enabled = preferences.vibration_enabled,
        "Alert settings updated"
    );

    Ok(Json(preferences))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_settings_request_partial() {
        let request: UpdateSettingsRequest =
            serde_json::from_str(r#"{"vibration_enabled": true}"#).unwrap();
        assert_eq!(request.alerts_enabled, None);
        assert_eq!(request.vibration_enabled, Some(true));
    }
}
