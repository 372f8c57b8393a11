//! Application configuration management.
//!
//! Handles loading, saving, and validating the gasmask configuration:
//! - Link to the mask (Bluetooth or local network) and discovery timing
//! - Reconnect backoff
//! - Gas thresholds
//! - Retention timing
//! - Alert toggles
//! - Time zone, data directory and HTTP bind address
//!
//! The file is TOML. Any field may be overridden from the environment with
//! `GASMASK__SECTION__FIELD`, e.g. `GASMASK__SERVER__BIND=127.0.0.1:8080`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::alerts::AlertPreferences;
use crate::backoff::ReconnectPolicy;
use crate::connection::ConnectionSettings;
use crate::retention::RetentionConfig;
use crate::thresholds::ThresholdConfig;
use crate::types::{Gas, TransportKind};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "GASMASK";

static MAC_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("Invalid regex"));

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The file exists but could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Layering or deserialization failed.
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    /// The configuration could not be turned into TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// One field holds an invalid value.
    #[error("Invalid {field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration problems", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Link to the mask.
    pub transport: TransportConfig,
    /// Reconnect backoff after a lost link.
    pub reconnect: ReconnectPolicy,
    /// Per-gas alert thresholds.
    pub thresholds: ThresholdConfig,
    /// Retention timing and capacity.
    pub retention: RetentionConfig,
    /// Alert toggles.
    pub alerts: AlertPreferences,
    /// Host settings.
    pub system: SystemConfig,
    /// HTTP server.
    pub server: ServerConfig,
}

/// Link selection and discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Which link to use.
    pub kind: TransportKind,
    /// Discovery window in seconds.
    pub scan_window_secs: u64,
    /// Session open timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Device to connect to without a scan (MAC address or network host).
    pub preferred_device: Option<String>,
    /// Connect to `preferred_device` at startup.
    pub auto_connect: bool,
    /// Bluetooth Low Energy settings.
    pub bluetooth: BluetoothConfig,
    /// Local network settings.
    pub network: NetworkConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Bluetooth,
            scan_window_secs: 10,
            connect_timeout_secs: 5,
            preferred_device: None,
            auto_connect: false,
            bluetooth: BluetoothConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Bluetooth Low Energy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Only report devices whose name starts with this prefix.
    pub name_prefix: Option<String>,
    /// GATT service carrying readings.
    pub service_uuid: Uuid,
    /// Notify characteristic carrying readings.
    pub characteristic_uuid: Uuid,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            name_prefix: Some("GasMask".to_string()),
            service_uuid: Uuid::from_u128(0x0000_ffe0_0000_1000_8000_0080_5f9b_34fb),
            characteristic_uuid: Uuid::from_u128(0x0000_ffe1_0000_1000_8000_0080_5f9b_34fb),
        }
    }
}

/// Local network settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Candidate hosts probed during a scan.
    pub hosts: Vec<String>,
    /// WebSocket port served by the mask.
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["gasmask.local".to_string(), "192.168.4.1".to_string()],
            port: 8080,
        }
    }
}

/// Host settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Time zone used for day boundaries in the calendar.
    #[serde(with = "timezone_serde")]
    pub timezone: Tz,
    /// Where readings and history are stored. Defaults per platform.
    pub data_dir: Option<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            data_dir: None,
        }
    }
}

impl SystemConfig {
    /// Effective data directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(crate::storage::default_data_dir)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parsed bind address.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `bind` is not a socket address.
    pub fn socket_addr(&self) -> ConfigResult<SocketAddr> {
        self.bind.parse().map_err(|_| ConfigError::ValidationError {
            field: "server.bind".to_string(),
            message: format!("'{}' is not a socket address", self.bind),
        })
    }
}

impl Config {
    /// Loads configuration from the default path.
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load() -> ConfigResult<Self> {
        let path = Self::config_path();
        let content = read_if_exists(&path)?;
        Self::from_sources(content.as_deref(), environment())
    }

    /// Loads configuration from an explicit path, which must exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist, or an
    /// error if it cannot be read, parsed or validated.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        let content =
            read_if_exists(path)?.ok_or_else(|| ConfigError::NotFound(path.display().to_string()))?;
        Self::from_sources(Some(&content), environment())
    }

    fn from_sources(content: Option<&str>, env: config::Environment) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(content) = content {
            builder = builder.add_source(config::File::from_str(
                content,
                config::FileFormat::Toml,
            ));
        }
        let loaded: Self = builder.add_source(env).build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Saves configuration to the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&Self::config_path())
    }

    /// Saves configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let write_error = |source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_error)
    }

    /// Default configuration file path.
    #[must_use]
    pub fn config_path() -> PathBuf {
        // On the Raspberry Pi: /etc/gasmask/config.toml
        // For development: ~/.config/gasmask/config.toml
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/gasmask/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "gasmask").map_or_else(
                || PathBuf::from("gasmask.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }

    /// Checks every field and reports all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a single problem or
    /// [`ConfigError::MultipleValidationErrors`] for several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, message: String| {
            if !ok {
                errors.push(ConfigError::ValidationError {
                    field: field.to_string(),
                    message,
                });
            }
        };

        let transport = &self.transport;
        check(
            transport.scan_window_secs > 0,
            "transport.scan_window_secs",
            "must be at least 1".to_string(),
        );
        check(
            transport.connect_timeout_secs > 0,
            "transport.connect_timeout_secs",
            "must be at least 1".to_string(),
        );
        check(
            transport.network.port > 0,
            "transport.network.port",
            "must not be 0".to_string(),
        );
        if transport.kind == TransportKind::Network {
            check(
                !transport.network.hosts.is_empty() || transport.preferred_device.is_some(),
                "transport.network.hosts",
                "at least one host is needed to find a device".to_string(),
            );
        }
        if let Some(device) = &transport.preferred_device {
            match transport.kind {
                TransportKind::Bluetooth => check(
                    MAC_ADDRESS.is_match(device),
                    "transport.preferred_device",
                    format!("'{device}' is not a Bluetooth address (AA:BB:CC:DD:EE:FF)"),
                ),
                TransportKind::Network => check(
                    !device.trim().is_empty(),
                    "transport.preferred_device",
                    "must not be empty".to_string(),
                ),
            }
        }
        check(
            !transport.auto_connect || transport.preferred_device.is_some(),
            "transport.auto_connect",
            "needs transport.preferred_device".to_string(),
        );

        let reconnect = &self.reconnect;
        check(
            reconnect.initial_delay_ms > 0,
            "reconnect.initial_delay_ms",
            "must be positive".to_string(),
        );
        check(
            reconnect.multiplier.is_finite() && reconnect.multiplier >= 1.0,
            "reconnect.multiplier",
            format!("{} must be at least 1.0", reconnect.multiplier),
        );
        check(
            reconnect.max_delay_ms >= reconnect.initial_delay_ms,
            "reconnect.max_delay_ms",
            "must not be below reconnect.initial_delay_ms".to_string(),
        );

        for gas in Gas::ALL {
            let limits = self.thresholds.for_gas(gas);
            let valid = limits.warning.is_finite()
                && limits.danger.is_finite()
                && limits.warning > 0.0
                && limits.warning < limits.danger;
            check(
                valid,
                &format!("thresholds.{}", threshold_key(gas)),
                format!(
                    "warning ({}) must be positive and below danger ({})",
                    limits.warning, limits.danger
                ),
            );
        }

        check(
            self.retention.capacity > 0,
            "retention.capacity",
            "must be at least 1".to_string(),
        );
        check(
            self.retention.retry_delay_secs > 0,
            "retention.retry_delay_secs",
            "must be at least 1".to_string(),
        );

        if let Err(e) = self.server.socket_addr() {
            errors.push(e);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Discovery window.
    #[must_use]
    pub const fn scan_window(&self) -> Duration {
        Duration::from_secs(self.transport.scan_window_secs)
    }

    /// Session open timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.connect_timeout_secs)
    }

    /// Settings for a connection manager.
    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            scan_window: self.scan_window(),
            connect_timeout: self.connect_timeout(),
            reconnect: self.reconnect,
            thresholds: self.thresholds.clone(),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

fn read_if_exists(path: &Path) -> ConfigResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        }),
    }
}

const fn threshold_key(gas: Gas) -> &'static str {
    match gas {
        Gas::Lpg => "lpg",
        Gas::Methane => "methane",
        Gas::CarbonMonoxide => "carbon_monoxide",
        Gas::Ammonia => "ammonia",
    }
}

mod timezone_serde {
    use chrono_tz::Tz;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env() -> config::Environment {
        env_with(&[])
    }

    fn env_with(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.transport.kind, TransportKind::Bluetooth);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.retention.capacity, 30);
        assert!(!config.alerts.alerts_enabled);
        assert_eq!(
            config.transport.bluetooth.characteristic_uuid.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let toml = r#"
            [transport]
            kind = "network"

            [transport.network]
            hosts = ["10.0.0.5"]

            [thresholds.lpg]
            warning = 500.0
            danger = 3000.0

            [system]
            timezone = "Europe/Berlin"
        "#;

        let config = Config::from_sources(Some(toml), no_env()).unwrap();

        assert_eq!(config.transport.kind, TransportKind::Network);
        assert_eq!(config.transport.network.hosts, vec!["10.0.0.5"]);
        assert_eq!(config.transport.network.port, 8080);
        assert!((config.thresholds.lpg.warning - 500.0).abs() < f64::EPSILON);
        assert!((config.thresholds.methane.warning - 1701.0).abs() < f64::EPSILON);
        assert_eq!(config.system.timezone, chrono_tz::Europe::Berlin);
    }

    #[test]
    fn test_environment_overrides_file() {
        let toml = "[server]\nbind = \"127.0.0.1:4000\"\n";
        let env = env_with(&[
            ("GASMASK__SERVER__BIND", "127.0.0.1:5000"),
            ("GASMASK__ALERTS__ALERTS_ENABLED", "true"),
        ]);

        let config = Config::from_sources(Some(toml), env).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:5000");
        assert!(config.alerts.alerts_enabled);
    }

    #[test]
    fn test_unknown_timezone_fails_to_load() {
        let toml = "[system]\ntimezone = \"Mars/Olympus\"\n";
        let err = Config::from_sources(Some(toml), no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let mut config = Config::default();
        config.transport.preferred_device = Some("not-a-mac".to_string());
        config.thresholds.ammonia.warning = 5000.0;
        config.retention.capacity = 0;

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => {
                let text: Vec<String> = errors.iter().map(ToString::to_string).collect();
                assert_eq!(errors.len(), 3, "{text:?}");
                assert!(text.iter().any(|t| t.contains("transport.preferred_device")));
                assert!(text.iter().any(|t| t.contains("thresholds.ammonia")));
                assert!(text.iter().any(|t| t.contains("retention.capacity")));
            }
            other => panic!("expected several errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_problem_is_reported_alone() {
        let mut config = Config::default();
        config.server.bind = "nowhere".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { ref field, .. }) if field == "server.bind"
        ));
    }

    #[test]
    fn test_mac_address_pattern() {
        assert!(MAC_ADDRESS.is_match("AA:BB:CC:dd:ee:01"));
        assert!(!MAC_ADDRESS.is_match("AA:BB:CC:DD:EE"));
        assert!(!MAC_ADDRESS.is_match("AA-BB-CC-DD-EE-FF"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc/config.toml");

        let mut config = Config::default();
        config.alerts.vibration_enabled = true;
        config.transport.preferred_device = Some("AA:BB:CC:DD:EE:FF".to_string());
        config.system.timezone = chrono_tz::Asia::Tokyo;
        config.save_to(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let loaded = Config::from_sources(Some(&content), no_env()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = Config::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_connection_settings() {
        let mut config = Config::default();
        config.transport.scan_window_secs = 3;
        let settings = config.connection_settings();
        assert_eq!(settings.scan_window, Duration::from_secs(3));
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.reconnect, config.reconnect);
    }
}
