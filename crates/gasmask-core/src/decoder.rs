//! Telemetry payload decoding.
//!
//! The mask reports its four sensor channels in one of two shapes:
//!
//! ```text
//! text frame (radio link):   mq2:123.4,mq4:56,mq9:0,mq135:12
//! JSON object (network link): {"mq2": 123.4, "mq4": 56, "mq9": 0, "mq135": 12}
//! ```
//!
//! Channel identifiers are matched case-insensitively, unknown channels are
//! ignored, and a repeated channel keeps its last occurrence. A payload is
//! accepted only when all four channels are present and hold a finite,
//! non-negative number. Nothing is ever defaulted to zero.

use serde_json::Value;
use thiserror::Error;

use crate::thresholds::ThresholdConfig;
use crate::types::{Gas, GasLevels, Reading};

/// Suffix some producers append to channel identifiers (`mq2_value`).
const VALUE_SUFFIX: &str = "_value";

/// A transport-specific payload as received from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Delimited `channel:value` text frame.
    Text(String),
    /// Structured object with one field per channel.
    Json(Value),
}

impl Payload {
    /// Wraps raw notification bytes as a text frame.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::Text(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Interprets a text message, treating JSON objects as structured payloads.
    #[must_use]
    pub fn from_message(message: &str) -> Self {
        let trimmed = message.trim();
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return Self::Json(value);
            }
        }
        Self::Text(message.to_string())
    }
}

/// Reasons a payload is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The payload contained nothing to decode.
    #[error("Empty payload")]
    Empty,

    /// One or more required channels were absent.
    #[error("Incomplete reading: missing {}", format_gases(.missing))]
    MissingChannels {
        /// Gases whose channel was not present.
        missing: Vec<Gas>,
    },

    /// A known channel carried something that is not a number.
    #[error("Channel '{channel}' has non-numeric value '{value}'")]
    NonNumeric {
        /// Channel identifier as it appeared in the payload.
        channel: String,
        /// Raw value text.
        value: String,
    },

    /// A known channel carried a negative or non-finite number.
    #[error("Channel '{channel}' has out-of-range value {value}")]
    InvalidValue {
        /// Channel identifier as it appeared in the payload.
        channel: String,
        /// Parsed value.
        value: f64,
    },

    /// A structured payload was not a JSON object.
    #[error("Structured payload is not an object")]
    NotAnObject,
}

fn format_gases(gases: &[Gas]) -> String {
    gases
        .iter()
        .map(|gas| gas.channel())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One parsed channel slot; last write wins.
type Slot = Option<Result<f64, DecodeError>>;

/// Decodes a payload into the four channel values.
///
/// # Errors
///
/// Returns a [`DecodeError`] when a channel is missing or malformed.
pub fn decode(payload: &Payload) -> Result<GasLevels, DecodeError> {
    match payload {
        Payload::Text(frame) => decode_frame(frame),
        Payload::Json(value) => decode_json(value),
    }
}

/// Decodes a payload and builds a classified [`Reading`].
///
/// # Errors
///
/// Returns a [`DecodeError`] when the payload is incomplete.
pub fn decode_reading(
    payload: &Payload,
    device_id: &str,
    timestamp: i64,
    thresholds: &ThresholdConfig,
) -> Result<Reading, DecodeError> {
    let levels = decode(payload)?;
    Ok(Reading {
        device_id: device_id.to_string(),
        timestamp,
        alert_level: thresholds.overall_level(&levels),
        levels,
    })
}

/// Decodes a `channel:value,channel:value` text frame.
///
/// # Errors
///
/// Returns a [`DecodeError`] when a channel is missing or malformed.
pub fn decode_frame(frame: &str) -> Result<GasLevels, DecodeError> {
    let frame = frame.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if frame.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut slots: [Slot; 4] = Default::default();
    for part in frame.split(',') {
        let Some((key, raw)) = part.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if let Some(gas) = channel_gas(key) {
            slots[gas.index()] = Some(parse_text_value(key, raw.trim()));
        }
    }
    collect(slots)
}

/// Decodes a structured payload.
///
/// Accepts the channel fields either at the top level or nested under a
/// `readings` object.
///
/// # Errors
///
/// Returns a [`DecodeError`] when a channel is missing or malformed.
pub fn decode_json(value: &Value) -> Result<GasLevels, DecodeError> {
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;
    let object = match object.get("readings").and_then(Value::as_object) {
        Some(nested) => nested,
        None => object,
    };
    if object.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut slots: [Slot; 4] = Default::default();
    for (key, raw) in object {
        if let Some(gas) = channel_gas(key) {
            let parsed = match raw {
                Value::Number(n) => n.as_f64().map_or_else(
                    || {
                        Err(DecodeError::NonNumeric {
                            channel: key.clone(),
                            value: n.to_string(),
                        })
                    },
                    |v| check_range(key, v),
                ),
                Value::String(s) => parse_text_value(key, s.trim()),
                other => Err(DecodeError::NonNumeric {
                    channel: key.clone(),
                    value: other.to_string(),
                }),
            };
            slots[gas.index()] = Some(parsed);
        }
    }
    collect(slots)
}

/// Encodes channel values as a text frame.
#[must_use]
pub fn encode_frame(levels: &GasLevels) -> String {
    levels
        .iter()
        .map(|(gas, value)| format!("{}:{value}", gas.channel()))
        .collect::<Vec<_>>()
        .join(",")
}

fn channel_gas(key: &str) -> Option<Gas> {
    let key = key.trim();
    let stripped = key
        .len()
        .checked_sub(VALUE_SUFFIX.len())
        .filter(|&at| key.is_char_boundary(at) && key[at..].eq_ignore_ascii_case(VALUE_SUFFIX))
        .map_or(key, |at| &key[..at]);
    Gas::from_channel(stripped)
}

fn parse_text_value(channel: &str, raw: &str) -> Result<f64, DecodeError> {
    raw.parse::<f64>()
        .map_err(|_| DecodeError::NonNumeric {
            channel: channel.to_string(),
            value: raw.to_string(),
        })
        .and_then(|value| check_range(channel, value))
}

fn check_range(channel: &str, value: f64) -> Result<f64, DecodeError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(DecodeError::InvalidValue {
            channel: channel.to_string(),
            value,
        })
    }
}

fn collect(slots: [Slot; 4]) -> Result<GasLevels, DecodeError> {
    let mut values = [0.0; 4];
    let mut missing = Vec::new();
    for (gas, slot) in Gas::ALL.into_iter().zip(slots) {
        match slot {
            Some(Ok(value)) => values[gas.index()] = value,
            Some(Err(err)) => return Err(err),
            None => missing.push(gas),
        }
    }
    if missing.is_empty() {
        Ok(GasLevels::from_array(values))
    } else {
        Err(DecodeError::MissingChannels { missing })
    }
}
