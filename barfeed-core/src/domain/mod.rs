//! Domain types for barfeed

pub mod bar;
pub mod instrument;

pub use bar::{resample_weekly, Bar, BarError, Frequency};
pub use instrument::{DataSource, Exchange, Instrument, InstrumentError};
