//! barfeed core: historical bar acquisition and feed assembly.
//!
//! - Domain types (instruments, bars, frequencies)
//! - Remote source adapters for equities (Yahoo chart API) and crypto
//!   (CoinMarketCap historical pages), selected by data source
//! - Per-(instrument, year) local CSV cache with atomic writes
//! - Canonical bar parsing with configurable malformed-row policy
//! - Feed assembly into per-instrument, strictly ordered series

pub mod config;
pub mod data;
pub mod domain;

pub use config::{AcquisitionConfig, ConfigError};
