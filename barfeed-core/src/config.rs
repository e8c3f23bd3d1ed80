//! Acquisition configuration, loadable from TOML.
//!
//! ```toml
//! instruments = ["BTC-CRYPTO", "SPY-NYSEARCA"]
//! from_year = 2020
//! to_year = 2021
//! storage = "data"
//! frequency = "day"
//! skip_errors = true
//!
//! [retry]
//! max_retries = 3
//!
//! [slugs]
//! ttl_days = 1
//! ```
//!
//! Everything except instruments, the year range and storage has a default.

use crate::data::coinmarketcap::DEFAULT_CRYPTO_BASE;
use crate::data::feed::DuplicatePolicy;
use crate::data::http::RetryPolicy;
use crate::data::parser::{ColumnMapping, ColumnNames, ParseOptions};
use crate::data::slugs::SlugPolicy;
use crate::data::yahoo::DEFAULT_EQUITY_BASE;
use crate::domain::{Frequency, Instrument};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no instruments configured")]
    NoInstruments,

    #[error("from_year {from} is after to_year {to}")]
    YearRange { from: i32, to: i32 },

    #[error("year {0} is outside the supported range 1..=9999")]
    YearOutOfRange(i32),

    #[error("invalid retry policy: {0}")]
    Retry(String),
}

/// Base URLs of the remote providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub equity_base: String,
    pub crypto_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            equity_base: DEFAULT_EQUITY_BASE.to_string(),
            crypto_base: DEFAULT_CRYPTO_BASE.to_string(),
        }
    }
}

/// Everything one acquisition run needs. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub instruments: Vec<Instrument>,
    pub from_year: i32,
    pub to_year: i32,
    pub storage: PathBuf,

    #[serde(default)]
    pub frequency: Frequency,
    /// Overrides every instrument's own timezone when set.
    #[serde(default)]
    pub timezone: Option<Tz>,
    #[serde(default)]
    pub skip_errors: bool,
    #[serde(default)]
    pub force_download: bool,
    #[serde(default)]
    pub skip_malformed_bars: bool,
    #[serde(default)]
    pub sanitize: bool,
    /// Local time of day assigned to each daily bar.
    #[serde(default = "default_bar_time")]
    pub daily_bar_time: NaiveTime,
    #[serde(default)]
    pub column_names: ColumnNames,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub slugs: SlugPolicy,
    #[serde(default)]
    pub endpoints: Endpoints,
}

fn default_bar_time() -> NaiveTime {
    NaiveTime::MIN
}

impl AcquisitionConfig {
    /// Config with every optional setting at its default.
    pub fn new(
        instruments: Vec<Instrument>,
        from_year: i32,
        to_year: i32,
        storage: impl Into<PathBuf>,
    ) -> Self {
        Self {
            instruments,
            from_year,
            to_year,
            storage: storage.into(),
            frequency: Frequency::default(),
            timezone: None,
            skip_errors: false,
            force_download: false,
            skip_malformed_bars: false,
            sanitize: false,
            daily_bar_time: default_bar_time(),
            column_names: ColumnNames::default(),
            duplicate_policy: DuplicatePolicy::default(),
            retry: RetryPolicy::default(),
            slugs: SlugPolicy::default(),
            endpoints: Endpoints::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instruments.is_empty() {
            return Err(ConfigError::NoInstruments);
        }
        for year in [self.from_year, self.to_year] {
            if !(1..=9999).contains(&year) {
                return Err(ConfigError::YearOutOfRange(year));
            }
        }
        if self.from_year > self.to_year {
            return Err(ConfigError::YearRange {
                from: self.from_year,
                to: self.to_year,
            });
        }
        self.retry.validate().map_err(ConfigError::Retry)?;
        Ok(())
    }

    /// Options for parsing one cached payload. Payloads hold daily rows
    /// whatever the run's frequency.
    pub fn parse_options(&self, instrument: &Instrument) -> ParseOptions {
        let source = instrument.datasource();
        ParseOptions {
            columns: ColumnMapping::for_source(source).with_overrides(&self.column_names),
            daily_bar_time: self.daily_bar_time,
            frequency: Frequency::Day,
            timezone: self.timezone.unwrap_or_else(|| instrument.timezone()),
            sanitize: self.sanitize,
            skip_malformed: self.skip_malformed_bars,
        }
    }
}
