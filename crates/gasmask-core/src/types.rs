//! Shared types and OpenAPI schemas.
//!
//! This module contains the data model that flows between the components of
//! the pipeline: gases and their channel values, readings, history entries,
//! discovered devices and connection status snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::thresholds::AlertLevel;

// ============================================================================
// Gases
// ============================================================================

/// A gas measured by the mask, in canonical order.
///
/// The declaration order is the canonical order used for every tie-break and
/// every message that lists gases: LPG, methane, carbon monoxide, ammonia.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Gas {
    /// Liquefied petroleum gas, read from the MQ-2 sensor.
    Lpg,
    /// Methane, read from the MQ-4 sensor.
    Methane,
    /// Carbon monoxide, read from the MQ-9 sensor.
    CarbonMonoxide,
    /// Ammonia, read from the MQ-135 sensor.
    Ammonia,
}

impl Gas {
    /// All gases in canonical order.
    pub const ALL: [Self; 4] = [Self::Lpg, Self::Methane, Self::CarbonMonoxide, Self::Ammonia];

    /// The sensor channel identifier this gas is reported on.
    #[must_use]
    pub const fn channel(self) -> &'static str {
        match self {
            Self::Lpg => "mq2",
            Self::Methane => "mq4",
            Self::CarbonMonoxide => "mq9",
            Self::Ammonia => "mq135",
        }
    }

    /// Looks up a gas by channel identifier, ignoring ASCII case.
    #[must_use]
    pub fn from_channel(channel: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|gas| gas.channel().eq_ignore_ascii_case(channel))
    }

    /// Human-readable name used in alerts.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Lpg => "LPG",
            Self::Methane => "Methane",
            Self::CarbonMonoxide => "Carbon Monoxide",
            Self::Ammonia => "Ammonia",
        }
    }

    /// Position in canonical order.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Gas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The four channel values of one reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "lpg": 123.4,
    "methane": 56.0,
    "carbon_monoxide": 0.0,
    "ammonia": 12.0
}))]
pub struct GasLevels {
    /// LPG concentration (MQ-2).
    pub lpg: f64,
    /// Methane concentration (MQ-4).
    pub methane: f64,
    /// Carbon monoxide concentration (MQ-9).
    pub carbon_monoxide: f64,
    /// Ammonia concentration (MQ-135).
    pub ammonia: f64,
}

impl GasLevels {
    /// Builds levels from per-gas values given in canonical order.
    #[must_use]
    pub const fn from_array(values: [f64; 4]) -> Self {
        Self {
            lpg: values[0],
            methane: values[1],
            carbon_monoxide: values[2],
            ammonia: values[3],
        }
    }

    /// Value of one gas.
    #[must_use]
    pub const fn get(&self, gas: Gas) -> f64 {
        match gas {
            Gas::Lpg => self.lpg,
            Gas::Methane => self.methane,
            Gas::CarbonMonoxide => self.carbon_monoxide,
            Gas::Ammonia => self.ammonia,
        }
    }

    /// Iterates `(gas, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Gas, f64)> + '_ {
        Gas::ALL.into_iter().map(|gas| (gas, self.get(gas)))
    }
}

// ============================================================================
// Readings
// ============================================================================

/// A point-in-time sensor snapshot from one device.
///
/// Readings are produced by the decoder, stamped by the connection manager
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "AA:BB:CC:DD:EE:FF",
    "timestamp": 1_744_000_000_000_i64,
    "levels": { "lpg": 123.4, "methane": 56.0, "carbon_monoxide": 0.0, "ammonia": 12.0 },
    "alert_level": "normal"
}))]
pub struct Reading {
    /// Identifier of the device that produced the reading.
    pub device_id: String,

    /// Milliseconds since the Unix epoch; non-decreasing per device.
    pub timestamp: i64,

    /// Channel values.
    pub levels: GasLevels,

    /// Highest alert level over the four gases.
    pub alert_level: AlertLevel,
}

impl Reading {
    /// Reading timestamp as a UTC date-time.
    #[must_use]
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// A reading admitted into the bounded retention history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HistoryEntry {
    /// Stable insertion-order position, increasing with every promotion.
    pub position: u64,

    /// The promoted reading.
    #[serde(flatten)]
    pub reading: Reading,
}

// ============================================================================
// Devices and connection status
// ============================================================================

/// The physical link used to reach a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Short-range radio link (Bluetooth Low Energy).
    Bluetooth,
    /// Local-network socket link.
    Network,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bluetooth => f.write_str("bluetooth"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// A device found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "AA:BB:CC:DD:EE:FF",
    "name": "GasMask",
    "kind": "bluetooth",
    "address": null,
    "rssi_dbm": -58
}))]
pub struct DeviceDescriptor {
    /// Stable device identifier (MAC address or network host).
    pub id: String,

    /// Advertised device name, if any.
    pub name: Option<String>,

    /// Link the device was discovered on.
    pub kind: TransportKind,

    /// Socket address for network devices (`host:port`).
    pub address: Option<String>,

    /// Signal strength in dBm, when the link reports one.
    pub rssi_dbm: Option<i16>,
}

impl DeviceDescriptor {
    /// Descriptor for a Bluetooth device.
    #[must_use]
    pub fn bluetooth(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            kind: TransportKind::Bluetooth,
            address: None,
            rssi_dbm: None,
        }
    }

    /// Descriptor for a device reachable on the local network.
    #[must_use]
    pub fn network(id: impl Into<String>, name: Option<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name,
            kind: TransportKind::Network,
            address: Some(address.into()),
            rssi_dbm: None,
        }
    }

    /// Name to show for the device, falling back to its identifier.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// State of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport session.
    #[default]
    Disconnected,
    /// Discovery window is open.
    Scanning,
    /// Opening a session to a chosen device.
    Connecting,
    /// Streaming readings.
    Connected,
    /// Link dropped; re-establishing the session.
    Reconnecting {
        /// Retry attempt in progress, starting at 1.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Short machine-readable name of the state.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Read-only snapshot of the connection manager's state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "state": { "state": "connected" },
    "device_id": "AA:BB:CC:DD:EE:FF",
    "device_name": "GasMask",
    "last_update": 1_744_000_000_000_i64
}))]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,

    /// Identifier of the device in use, if any.
    pub device_id: Option<String>,

    /// Name of the device in use, if any.
    pub device_name: Option<String>,

    /// Timestamp of the last accepted reading (milliseconds since epoch).
    pub last_update: Option<i64>,
}
