//! Connection API endpoints.
//!
//! Provides endpoints for the link status, device discovery, connecting and
//! disconnecting.

use std::time::Instant;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use gasmask_core::{ConnectionStatus, DeviceDescriptor, TransportKind};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::daemon::preferred_descriptor;
use crate::state::SharedState;

// Note: Routes are exposed directly in api.rs at /api/status, /api/devices,
// /api/connect and /api/disconnect.

// ============================================================================
// Request/Response Types
// ============================================================================

/// Pipeline status response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "connection": {
        "state": { "state": "connected" },
        "device_id": "AA:BB:CC:DD:EE:FF",
        "device_name": "GasMask",
        "last_update": 1_744_000_000_000_i64
    },
    "transport": "bluetooth",
    "alert_active": false,
    "readings_processed": 412,
    "pending_promotions": 3,
    "uptime_secs": 3600
}))]
pub struct StatusResponse {
    /// Link state and device in use.
    pub connection: ConnectionStatus,

    /// Configured link.
    pub transport: TransportKind,

    /// Whether a danger alert session is open.
    #[schema(example = false)]
    pub alert_active: bool,

    /// Readings handled since startup.
    #[schema(example = 412)]
    pub readings_processed: u64,

    /// Readings waiting for promotion into history.
    #[schema(example = 3)]
    pub pending_promotions: usize,

    /// Server uptime in seconds.
    #[schema(example = 3600)]
    pub uptime_secs: u64,
}

/// Device scan response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "devices": [
        {
            "id": "AA:BB:CC:DD:EE:FF",
            "name": "GasMask",
            "kind": "bluetooth",
            "address": null,
            "rssi_dbm": -58
        }
    ],
    "scan_duration_secs": 10,
    "scanned_at_utc": "2025-03-10T12:00:00Z"
}))]
pub struct ScanDevicesResponse {
    /// Discovered devices, one per identifier.
    pub devices: Vec<DeviceDescriptor>,

    /// How long the scan took.
    #[schema(example = 10)]
    pub scan_duration_secs: u64,

    /// When the scan completed.
    #[schema(example = "2025-03-10T12:00:00Z")]
    pub scanned_at_utc: String,
}

/// Request to connect to a device.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "AA:BB:CC:DD:EE:FF",
    "name": "GasMask"
}))]
pub struct ConnectRequest {
    /// Device identifier from a scan. Defaults to the configured preferred
    /// device.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub device_id: Option<String>,

    /// Device name, shown in the status.
    #[schema(example = "GasMask")]
    pub name: Option<String>,

    /// Socket address for network devices (`host:port`).
    #[schema(example = "192.168.4.1:8080")]
    pub address: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get pipeline status.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "connection",
    operation_id = "getStatus",
    summary = "Get link and pipeline status",
    description = "Returns the connection state, the device in use, the \
        timestamp of the last accepted reading and pipeline counters. The \
        last reading stays available while reconnecting.",
    responses(
        (status = 200, description = "Status retrieved", body = StatusResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    let state_guard = state.read().await;
    let alert_active = state_guard.alert_session.borrow().is_some();
    let readings_processed = *state_guard.processed.borrow();

    Json(StatusResponse {
        connection: state_guard.manager.status(),
        transport: state_guard.config.transport.kind,
        alert_active,
        readings_processed,
        pending_promotions: state_guard.retention.pending(),
        uptime_secs: state_guard.uptime_secs(),
    })
}

/// Scan for devices.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "connection",
    operation_id = "scanDevices",
    summary = "Scan for masks",
    description = "Opens a discovery window (10 seconds by default) and \
        returns every device seen, deduplicated by identifier. Only possible \
        while disconnected.",
    responses(
        (status = 200, description = "Scan completed", body = ScanDevicesResponse),
        (status = 403, description = "Link permission not granted", body = ErrorResponse),
        (status = 409, description = "Not disconnected", body = ErrorResponse),
        (status = 503, description = "Scan failed", body = ErrorResponse)
    )
)]
pub async fn scan_devices(
    State(state): State<SharedState>,
) -> ApiResult<Json<ScanDevicesResponse>> {
    let manager = state.read().await.manager.clone();

    let started = Instant::now();
    let devices = manager.scan().await?;

    Ok(Json(ScanDevicesResponse {
        devices,
        scan_duration_secs: started.elapsed().as_secs(),
        scanned_at_utc: Utc::now().to_rfc3339(),
    }))
}

/// Connect to a device.
#[utoipa::path(
    post,
    path = "/api/connect",
    tag = "connection",
    operation_id = "connectDevice",
    summary = "Connect to a mask",
    description = "Opens a session to the given device, or to the configured \
        preferred device when no identifier is given, and starts streaming \
        readings. Only possible while disconnected.",
    request_body = ConnectRequest,
    responses(
        (status = 200, description = "Connected", body = ConnectionStatus),
        (status = 400, description = "No device given and none configured", body = ErrorResponse),
        (status = 403, description = "Link permission not granted", body = ErrorResponse),
        (status = 409, description = "Not disconnected", body = ErrorResponse),
        (status = 502, description = "Device could not be reached", body = ErrorResponse)
    )
)]
pub async fn connect_device(
    State(state): State<SharedState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<Json<ConnectionStatus>> {
    let (manager, device) = {
        let state_guard = state.read().await;
        let transport = &state_guard.config.transport;
        let id = request
            .device_id
            .clone()
            .or_else(|| transport.preferred_device.clone())
            .ok_or_else(|| {
                ApiError::bad_request(
                    "no_device",
                    "No device_id given and no preferred device configured",
                )
            })?;

        let mut device = match request.address.clone() {
            Some(address) => DeviceDescriptor::network(id, None, address),
            None => preferred_descriptor(id, transport.kind, transport.network.port),
        };
        device.name = request.name.clone();
        (state_guard.manager.clone(), device)
    };

    info!(device_id = %device.id, "Connect requested");
    manager.connect(device).await?;
    Ok(Json(manager.status()))
}

/// Disconnect from the device.
#[utoipa::path(
    post,
    path = "/api/disconnect",
    tag = "connection",
    operation_id = "disconnectDevice",
    summary = "Disconnect from the mask",
    description = "Tears down the session and cancels any scan, connect or \
        reconnect in progress. Always succeeds.",
    responses(
        (status = 200, description = "Disconnected", body = ConnectionStatus)
    )
)]
pub async fn disconnect_device(State(state): State<SharedState>) -> Json<ConnectionStatus> {
    let manager = state.read().await.manager.clone();
    manager.disconnect().await;
    Json(manager.status())
}
