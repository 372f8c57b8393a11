//! Trend and calendar views over the retention history.
//!
//! These are pure functions of a history slice; they never touch the
//! retention buffer itself. Day boundaries follow the configured time zone.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::thresholds::{AlertLevel, ThresholdConfig};
use crate::types::{Gas, HistoryEntry};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Time span covered by a trend summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TrendWindow {
    /// The last 7 days.
    #[default]
    Week,
    /// The last 30 days.
    Month,
}

impl TrendWindow {
    /// Length of the window in days.
    #[must_use]
    pub const fn days(self) -> i64 {
        match self {
            Self::Week => 7,
            Self::Month => 30,
        }
    }
}

/// Highest value of one gas at each alert level.
///
/// A level with no reading in the window is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LevelMaxima {
    /// The gas.
    pub gas: Gas,
    /// Highest value classified as normal.
    pub normal: Option<f64>,
    /// Highest value classified as warning.
    pub warning: Option<f64>,
    /// Highest value classified as danger.
    pub danger: Option<f64>,
}

impl LevelMaxima {
    const fn empty(gas: Gas) -> Self {
        Self {
            gas,
            normal: None,
            warning: None,
            danger: None,
        }
    }

    /// Maximum at one level.
    #[must_use]
    pub const fn at(&self, level: AlertLevel) -> Option<f64> {
        match level {
            AlertLevel::Normal => self.normal,
            AlertLevel::Warning => self.warning,
            AlertLevel::Danger => self.danger,
        }
    }

    fn record(&mut self, level: AlertLevel, value: f64) {
        let slot = match level {
            AlertLevel::Normal => &mut self.normal,
            AlertLevel::Warning => &mut self.warning,
            AlertLevel::Danger => &mut self.danger,
        };
        *slot = Some(slot.map_or(value, |current| current.max(value)));
    }
}

/// Per-gas maxima over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TrendSummary {
    /// Window the summary covers.
    pub window: TrendWindow,
    /// Start of the window (milliseconds since epoch).
    pub since: i64,
    /// Number of history entries inside the window.
    pub entry_count: usize,
    /// One entry per gas, in canonical order.
    pub gases: Vec<LevelMaxima>,
}

/// One local day of the calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CalendarDay {
    /// Local date.
    pub date: NaiveDate,
    /// Short weekday label (`Mon`, `Tue`, ...).
    pub weekday: String,
    /// Most severe alert level recorded that day, if any.
    pub peak_level: Option<AlertLevel>,
    /// Entries recorded that day, most recent first.
    pub entries: Vec<HistoryEntry>,
}

/// Maximum value per gas per alert level over `window` ending at `now_ms`.
#[must_use]
pub fn level_maxima(
    entries: &[HistoryEntry],
    window: TrendWindow,
    now_ms: i64,
    thresholds: &ThresholdConfig,
) -> TrendSummary {
    let since = now_ms - window.days() * DAY_MS;
    let mut gases = Gas::ALL.map(LevelMaxima::empty);
    let mut entry_count = 0;

    for entry in entries {
        let timestamp = entry.reading.timestamp;
        if timestamp < since || timestamp > now_ms {
            continue;
        }
        entry_count += 1;
        for (gas, value) in entry.reading.levels.iter() {
            gases[gas.index()].record(thresholds.classify(gas, value), value);
        }
    }

    TrendSummary {
        window,
        since,
        entry_count,
        gases: gases.to_vec(),
    }
}

/// Local date of a timestamp.
#[must_use]
pub fn local_date(timestamp_ms: i64, tz: Tz) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(timestamp_ms).map(|utc| utc.with_timezone(&tz).date_naive())
}

/// Entries recorded on `date`, most recent first.
#[must_use]
pub fn readings_on(entries: &[HistoryEntry], date: NaiveDate, tz: Tz) -> Vec<HistoryEntry> {
    let mut day: Vec<HistoryEntry> = entries
        .iter()
        .filter(|entry| local_date(entry.reading.timestamp, tz) == Some(date))
        .cloned()
        .collect();
    day.sort_by(|a, b| b.reading.timestamp.cmp(&a.reading.timestamp));
    day
}

/// The last `days` local days ending at `today`, oldest first.
#[must_use]
pub fn calendar(entries: &[HistoryEntry], today: NaiveDate, tz: Tz, days: u32) -> Vec<CalendarDay> {
    (0..i64::from(days))
        .rev()
        .map(|back| {
            let date = today - ChronoDuration::days(back);
            let day_entries = readings_on(entries, date, tz);
            CalendarDay {
                date,
                weekday: date.weekday().to_string(),
                peak_level: day_entries.iter().map(|e| e.reading.alert_level).max(),
                entries: day_entries,
            }
        })
        .collect()
}
