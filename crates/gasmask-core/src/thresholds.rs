//! Gas thresholds and alert level classification.
//!
//! Maps a raw per-gas sensor value to an ordinal [`AlertLevel`]. Thresholds
//! are configurable per deployment; the defaults are the reference values
//! the mask firmware was calibrated against.
//!
//! # Example
//!
//! ```
//! use gasmask_core::{AlertLevel, Gas, ThresholdConfig};
//!
//! let thresholds = ThresholdConfig::default();
//! assert_eq!(thresholds.classify(Gas::Lpg, 800.0), AlertLevel::Warning);
//! assert_eq!(thresholds.classify(Gas::Methane, 4000.0), AlertLevel::Danger);
//! ```

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::types::{Gas, GasLevels};

/// Ordinal alert level of a gas value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Below the warning threshold.
    #[default]
    Normal,
    /// At or above the warning threshold.
    Warning,
    /// At or above the danger threshold.
    Danger,
}

impl AlertLevel {
    /// All levels in ascending severity.
    pub const ALL: [Self; 3] = [Self::Normal, Self::Warning, Self::Danger];

    /// Display label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
            Self::Danger => "Danger",
        }
    }
}

/// Warning and danger thresholds for one gas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GasThresholds {
    /// Values at or above this are [`AlertLevel::Warning`].
    pub warning: f64,
    /// Values at or above this are [`AlertLevel::Danger`].
    pub danger: f64,
}

impl GasThresholds {
    /// Creates thresholds for one gas.
    #[must_use]
    pub const fn new(warning: f64, danger: f64) -> Self {
        Self { warning, danger }
    }

    /// Classifies a value against these thresholds.
    #[must_use]
    pub fn level(&self, value: f64) -> AlertLevel {
        if value >= self.danger {
            AlertLevel::Danger
        } else if value >= self.warning {
            AlertLevel::Warning
        } else {
            AlertLevel::Normal
        }
    }
}

/// Per-gas thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ThresholdConfig {
    /// LPG thresholds.
    pub lpg: GasThresholds,
    /// Methane thresholds.
    pub methane: GasThresholds,
    /// Carbon monoxide thresholds.
    pub carbon_monoxide: GasThresholds,
    /// Ammonia thresholds.
    pub ammonia: GasThresholds,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            lpg: GasThresholds::new(800.0, 4000.0),
            methane: GasThresholds::new(1701.0, 4000.0),
            carbon_monoxide: GasThresholds::new(1701.0, 4000.0),
            ammonia: GasThresholds::new(1701.0, 4000.0),
        }
    }
}

impl ThresholdConfig {
    /// Thresholds for one gas.
    #[must_use]
    pub const fn for_gas(&self, gas: Gas) -> &GasThresholds {
        match gas {
            Gas::Lpg => &self.lpg,
            Gas::Methane => &self.methane,
            Gas::CarbonMonoxide => &self.carbon_monoxide,
            Gas::Ammonia => &self.ammonia,
        }
    }

    /// Classifies a single gas value.
    #[must_use]
    pub fn classify(&self, gas: Gas, value: f64) -> AlertLevel {
        self.for_gas(gas).level(value)
    }

    /// Classifies every gas of a reading, in canonical order.
    #[must_use]
    pub fn classify_levels(&self, levels: &GasLevels) -> [(Gas, AlertLevel); 4] {
        Gas::ALL.map(|gas| (gas, self.classify(gas, levels.get(gas))))
    }

    /// The most severe level over the four gases.
    #[must_use]
    pub fn overall_level(&self, levels: &GasLevels) -> AlertLevel {
        self.classify_levels(levels)
            .into_iter()
            .map(|(_, level)| level)
            .max()
            .unwrap_or_default()
    }

    /// Gases currently at `level`, in canonical order.
    #[must_use]
    pub fn gases_at(&self, levels: &GasLevels, level: AlertLevel) -> Vec<Gas> {
        self.classify_levels(levels)
            .into_iter()
            .filter(|(_, l)| *l == level)
            .map(|(gas, _)| gas)
            .collect()
    }
}

/// The gas with the highest raw value.
///
/// Ties go to the gas that comes first in canonical order, so the result
/// never depends on iteration order.
#[must_use]
pub fn highest_gas(levels: &GasLevels) -> (Gas, f64) {
    levels
        .iter()
        .fold((Gas::Lpg, levels.lpg), |best, candidate| {
            if candidate.1 > best.1 {
                candidate
            } else {
                best
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_danger_at_4000_for_every_gas() {
        let thresholds = ThresholdConfig::default();
        for gas in Gas::ALL {
            assert_eq!(thresholds.classify(gas, 4000.0), AlertLevel::Danger, "{gas}");
        }
    }

    #[test]
    fn test_lpg_boundaries() {
        let thresholds = ThresholdConfig::default();
        assert_eq!(thresholds.classify(Gas::Lpg, 799.0), AlertLevel::Normal);
        assert_eq!(thresholds.classify(Gas::Lpg, 800.0), AlertLevel::Warning);
        assert_eq!(thresholds.classify(Gas::Lpg, 3999.0), AlertLevel::Warning);
    }

    #[test]
    fn test_other_gas_boundaries() {
        let thresholds = ThresholdConfig::default();
        for gas in [Gas::Methane, Gas::CarbonMonoxide, Gas::Ammonia] {
            assert_eq!(thresholds.classify(gas, 1700.0), AlertLevel::Normal);
            assert_eq!(thresholds.classify(gas, 1701.0), AlertLevel::Warning);
            assert_eq!(thresholds.classify(gas, 3999.9), AlertLevel::Warning);
        }
        assert_eq!(thresholds.classify(Gas::Ammonia, 0.0), AlertLevel::Normal);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let thresholds = ThresholdConfig::default();
        for value in [0.0, 1.5, 799.99, 1701.0, 10_000.0] {
            for gas in Gas::ALL {
                assert_eq!(thresholds.classify(gas, value), thresholds.classify(gas, value));
            }
        }
    }

    #[test]
    fn test_overall_level_and_gases_at() {
        let thresholds = ThresholdConfig::default();
        let levels = GasLevels::from_array([900.0, 4500.0, 0.0, 4000.0]);
        assert_eq!(thresholds.overall_level(&levels), AlertLevel::Danger);
        assert_eq!(
            thresholds.gases_at(&levels, AlertLevel::Danger),
            vec![Gas::Methane, Gas::Ammonia]
        );
        assert_eq!(thresholds.gases_at(&levels, AlertLevel::Warning), vec![Gas::Lpg]);
    }

    #[test]
    fn test_highest_gas_tie_goes_to_lpg() {
        let levels = GasLevels::from_array([5000.0, 5000.0, 10.0, 10.0]);
        assert_eq!(highest_gas(&levels).0, Gas::Lpg);
    }

    #[test]
    fn test_highest_gas_tie_among_later_gases() {
        let levels = GasLevels::from_array([1.0, 2.0, 9.0, 9.0]);
        assert_eq!(highest_gas(&levels).0, Gas::CarbonMonoxide);
    }

    #[test]
    fn test_custom_thresholds_deserialize_with_defaults() {
        let config: ThresholdConfig =
            toml::from_str("[lpg]\nwarning = 100.0\ndanger = 200.0\n").unwrap();
        assert_eq!(config.classify(Gas::Lpg, 150.0), AlertLevel::Warning);
        assert_eq!(config.methane, ThresholdConfig::default().methane);
    }
}
