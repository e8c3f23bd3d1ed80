//! Source adapter trait, fetch windows and structured error types.
//!
//! The `SourceAdapter` trait abstracts over remote providers so tests can swap
//! in scripted adapters. Which adapter serves an instrument is decided by the
//! closed `DataSource` enum through `SourceRouter`, never by string tags.
//! The cache layer sits above this trait; adapters never see the cache.

use super::http::CancelToken;
use super::orchestrator::PairKey;
use super::progress::AcquisitionEvents;
use crate::domain::{DataSource, Frequency, Instrument};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for acquisition.
///
/// These are designed to be displayable in both log lines and CLI output.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network failure for {url}: {reason}")]
    NetworkFailure {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("rate limited by {url}: gave up after {attempts} attempts")]
    RateLimitExceeded { url: String, attempts: u32 },

    #[error("response format changed: {0}")]
    SchemaMismatch(String),

    #[error("malformed bar at line {line}: {reason} (row: {row})")]
    MalformedBar {
        line: u64,
        row: String,
        reason: String,
    },

    #[error("no URL slug known for crypto symbol '{symbol}'")]
    UnknownSymbolMapping { symbol: String },

    #[error("cache write failed for {}: {reason}", .path.display())]
    CacheWriteFailure { path: PathBuf, reason: String },

    #[error("cache read failed for {}: {reason}", .path.display())]
    CacheReadFailure { path: PathBuf, reason: String },

    #[error("CSV encoding failed: {0}")]
    EncodeFailure(String),

    #[error("{data_source} source does not support {frequency} bars")]
    UnsupportedFrequency {
        data_source: DataSource,
        frequency: Frequency,
    },

    #[error("acquisition cancelled")]
    Cancelled,
}

/// Inclusive calendar window to fetch.
///
/// `start` and `end` are the first and last bar dates. For weekly windows
/// those are week-start Sundays, and the daily rows behind them run through
/// `last_day()`, the Saturday closing the last week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub frequency: Frequency,
}

impl FetchWindow {
    /// Window covering one calendar year.
    ///
    /// Weekly windows run from the Sunday before the year's first Monday to
    /// the Sunday before its last Monday, so every week is whole.
    pub fn for_year(year: i32, frequency: Frequency) -> Option<Self> {
        let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)?;
        let dec31 = NaiveDate::from_ymd_opt(year, 12, 31)?;
        let (start, end) = match frequency {
            Frequency::Day => (jan1, dec31),
            Frequency::Week => {
                let first_monday = (0..7)
                    .map(|d| jan1 + Duration::days(d))
                    .find(|d| d.weekday() == Weekday::Mon)?;
                let last_monday = (0..7)
                    .map(|d| dec31 - Duration::days(d))
                    .find(|d| d.weekday() == Weekday::Mon)?;
                (
                    first_monday - Duration::days(1),
                    last_monday - Duration::days(1),
                )
            }
        };
        Some(Self {
            start,
            end,
            frequency,
        })
    }

    /// Last calendar day whose daily row belongs to the window.
    pub fn last_day(&self) -> NaiveDate {
        match self.frequency {
            Frequency::Day => self.end,
            Frequency::Week => self.end + Duration::days(6),
        }
    }

    /// Number of calendar days covered (inclusive).
    pub fn days(&self) -> usize {
        ((self.last_day() - self.start).num_days() + 1).max(0) as usize
    }

    /// Whether a daily row dated `date` belongs to the window.
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.last_day()
    }
}

/// Everything an adapter needs for one fetch.
///
/// The logging capability and the cancel token are owned by the caller and
/// lent to the adapter for the duration of the call.
pub struct FetchRequest<'a> {
    pub pair: &'a PairKey,
    pub window: FetchWindow,
    pub events: &'a dyn AcquisitionEvents,
    pub cancel: &'a CancelToken,
}

impl<'a> FetchRequest<'a> {
    pub fn instrument(&self) -> &Instrument {
        &self.pair.instrument
    }

    pub fn context(&self) -> FetchContext<'a> {
        FetchContext {
            pair: Some(self.pair),
            events: self.events,
            cancel: self.cancel,
        }
    }
}

/// Reporting and cancellation context for a single HTTP exchange.
#[derive(Clone, Copy)]
pub struct FetchContext<'a> {
    pub pair: Option<&'a PairKey>,
    pub events: &'a dyn AcquisitionEvents,
    pub cancel: &'a CancelToken,
}

/// A remote provider of raw bar data.
///
/// Implementations return the raw payload as CSV bytes in the provider's own
/// column layout; `BarParser` turns it into canonical bars.
pub trait SourceAdapter: Send + Sync {
    /// Human-readable name of this adapter.
    fn name(&self) -> &str;

    /// The data source this adapter serves.
    fn source(&self) -> DataSource;

    /// Whether bars of this frequency can be acquired.
    fn supports(&self, frequency: Frequency) -> bool;

    /// Fetch the raw payload for one instrument over one window.
    fn fetch_raw_range(&self, request: &FetchRequest<'_>) -> Result<Vec<u8>, DataError>;
}

/// One adapter per data source, selected by exhaustive match.
pub struct SourceRouter {
    equity: Box<dyn SourceAdapter>,
    crypto: Box<dyn SourceAdapter>,
}

impl SourceRouter {
    pub fn new(equity: Box<dyn SourceAdapter>, crypto: Box<dyn SourceAdapter>) -> Self {
        Self { equity, crypto }
    }

    pub fn adapter_for(&self, source: DataSource) -> &dyn SourceAdapter {
        match source {
            DataSource::Equity => self.equity.as_ref(),
            DataSource::Crypto => self.crypto.as_ref(),
        }
    }
}
