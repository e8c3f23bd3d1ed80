//! Bars: the unit of market data flowing through the feed.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bar frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    #[serde(alias = "daily")]
    Day,
    #[serde(alias = "weekly")]
    Week,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Day => f.write_str("daily"),
            Frequency::Week => f.write_str("weekly"),
        }
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" | "daily" | "1d" => Ok(Frequency::Day),
            "week" | "weekly" | "1w" => Ok(Frequency::Week),
            other => Err(format!("unknown frequency '{other}' (expected daily or weekly)")),
        }
    }
}

/// OHLCV bar for one instrument at one timestamp.
///
/// Invariants (enforced by both constructors): all values finite,
/// `low <= open, close <= high`, `volume >= 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Tz>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: f64,
    pub frequency: Frequency,
}

impl Bar {
    /// Strict constructor: rejects internally inconsistent extremes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp: DateTime<Tz>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        adj_close: f64,
        volume: f64,
        frequency: Frequency,
    ) -> Result<Self, BarError> {
        let bar = Self {
            timestamp,
            open,
            high,
            low,
            close,
            adj_close,
            volume,
            frequency,
        };
        bar.check_values()?;
        if bar.low > bar.open || bar.low > bar.close || bar.high < bar.open || bar.high < bar.close
        {
            return Err(BarError::InconsistentExtremes {
                open,
                high,
                low,
                close,
            });
        }
        Ok(bar)
    }

    /// Tolerant constructor: widens `low`/`high` to include `open` and `close`
    /// instead of rejecting the bar.
    #[allow(clippy::too_many_arguments)]
    pub fn sanitized(
        timestamp: DateTime<Tz>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        adj_close: f64,
        volume: f64,
        frequency: Frequency,
    ) -> Result<Self, BarError> {
        let bar = Self {
            timestamp,
            open,
            high: high.max(open).max(close),
            low: low.min(open).min(close),
            close,
            adj_close,
            volume,
            frequency,
        };
        bar.check_values()?;
        Ok(bar)
    }

    /// True when `sanitized` would have to move `low` or `high`.
    pub fn needs_repair(open: f64, high: f64, low: f64, close: f64) -> bool {
        low > open || low > close || high < open || high < close
    }

    fn check_values(&self) -> Result<(), BarError> {
        let fields = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("adj_close", self.adj_close),
            ("volume", self.volume),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(BarError::NonFinite { field: name });
            }
        }
        if self.volume < 0.0 {
            return Err(BarError::NegativeVolume(self.volume));
        }
        Ok(())
    }
}

/// Aggregate ascending daily bars into Sunday-anchored weekly bars.
///
/// Each week is stamped on its Sunday at the time of day of its first daily
/// bar. It takes the first open, the last close and adjusted close, the
/// extremes of the week and the summed volume.
pub fn resample_weekly(daily: &[Bar]) -> Vec<Bar> {
    let mut weekly: Vec<Bar> = Vec::new();
    let mut current: Option<NaiveDate> = None;
    for bar in daily {
        let local = bar.timestamp.naive_local();
        let week = week_start(local.date());
        match weekly.last_mut() {
            Some(acc) if current == Some(week) => {
                acc.high = acc.high.max(bar.high);
                acc.low = acc.low.min(bar.low);
                acc.close = bar.close;
                acc.adj_close = bar.adj_close;
                acc.volume += bar.volume;
            }
            _ => {
                // Sunday midnight can fall in a DST gap; keep the day's own stamp then.
                let timestamp = bar
                    .timestamp
                    .timezone()
                    .from_local_datetime(&week.and_time(local.time()))
                    .earliest()
                    .unwrap_or(bar.timestamp);
                weekly.push(Bar {
                    timestamp,
                    frequency: Frequency::Week,
                    ..bar.clone()
                });
                current = Some(week);
            }
        }
    }
    weekly
}

/// The Sunday on or before `date`.
fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_sunday()))
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BarError {
    #[error("{field} is not a finite number")]
    NonFinite { field: &'static str },

    #[error("negative volume {0}")]
    NegativeVolume(f64),

    #[error("inconsistent extremes: open={open} high={high} low={low} close={close}")]
    InconsistentExtremes {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}
