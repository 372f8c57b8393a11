//! # gasmask-core
//!
//! Telemetry ingestion and alerting for the gas mask.
//!
//! This crate turns an intermittent link to the mask's sensor board into a
//! classified stream of readings, a bounded and rate-limited history, and
//! danger alerts:
//! - Device discovery, connection and automatic reconnect over Bluetooth LE
//!   or the local network
//! - Strict decoding of sensor frames
//! - Per-gas threshold classification
//! - Delayed, throttled promotion of readings into history
//! - Alert sessions driving vibration, speech and notifications
//!
//! ## Architecture
//!
//! - [`transport`] - The link to the mask (`bluer` or WebSocket) behind one trait
//! - [`decoder`] - Payload to reading, rejecting incomplete frames
//! - [`thresholds`] - Gas value to alert level
//! - [`connection`] - Connection state machine, reconnect loop and reading fan-out
//! - [`backoff`] - Reconnect delay schedule
//! - [`retention`] - Current reading and bounded history
//! - [`trends`] - Per-level maxima and calendar views of the history
//! - [`alerts`] - Alert sessions and their side effects
//! - [`pipeline`] - Feeds readings to retention, alerts and storage
//! - [`storage`] - Reading log and history snapshot on disk
//! - [`config`] - Configuration loading, saving, and validation
//! - [`clock`] - Wall-clock source for reading timestamps
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas
//!
//! ## Example
//!
//! ```rust
//! use gasmask_core::{AlertLevel, Gas, ThresholdConfig};
//!
//! let thresholds = ThresholdConfig::default();
//! assert_eq!(thresholds.classify(Gas::Lpg, 800.0), AlertLevel::Warning);
//! assert_eq!(thresholds.classify(Gas::Ammonia, 4000.0), AlertLevel::Danger);
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod alerts;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod pipeline;
pub mod retention;
pub mod storage;
pub mod thresholds;
pub mod transport;
pub mod trends;
pub mod types;

// Re-export primary types for convenience
pub use alerts::{
    evacuation_message, AlertDispatcher, AlertNotification, AlertOutcome, AlertPreferences,
    AlertSession, LogSink, Notifier, SinkError, Speaker, VibrationPattern, Vibrator,
};
pub use backoff::ReconnectPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BluetoothConfig, Config, ConfigError, ConfigResult, NetworkConfig, ServerConfig,
    SystemConfig, TransportConfig,
};
pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionSettings,
};
pub use decoder::{decode, decode_reading, DecodeError, Payload};
pub use error::{Error, GasMaskError, Result};
pub use pipeline::PipelineHandle;
pub use retention::{
    HistorySnapshot, PromotionOutcome, RetentionBuffer, RetentionConfig, RetentionService,
};
pub use storage::{default_data_dir, ReadingSink, Storage, StorageError, StorageSink};
pub use thresholds::{highest_gas, AlertLevel, GasThresholds, ThresholdConfig};
pub use transport::{AnySession, AnyTransport, Session, SessionEvent, Transport, TransportError};
pub use trends::{CalendarDay, LevelMaxima, TrendSummary, TrendWindow};
pub use types::{
    ConnectionState, ConnectionStatus, DeviceDescriptor, Gas, GasLevels, HistoryEntry, Reading,
    TransportKind,
};
