//! Canonical bar parsing.
//!
//! Turns a per-source CSV payload into canonical `Bar`s. Column names come
//! from the source defaults overlaid with caller overrides; dates are
//! localized to the requested timezone at a fixed daily bar time.
//!
//! Row policy: a row that fails conversion (or, without sanitization, has
//! inconsistent extremes) is either dropped and counted (`skip_malformed`)
//! or aborts the file with `MalformedBar` carrying the raw row.

use super::provider::DataError;
use crate::domain::{Bar, DataSource, Frequency};
use chrono::{NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CANONICAL_HEADER: [&str; 7] = [
    "Date",
    "Open",
    "High",
    "Low",
    "Close",
    "Adj Close",
    "Volume",
];

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Caller-supplied column name overrides. Unset fields keep the source default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnNames {
    pub datetime: Option<String>,
    pub open: Option<String>,
    pub high: Option<String>,
    pub low: Option<String>,
    pub close: Option<String>,
    pub volume: Option<String>,
    pub adj_close: Option<String>,
}

/// Resolved column names for one parse call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub date: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    /// Optional: when absent from the file, adjusted close equals close.
    pub adj_close: Option<String>,
}

impl ColumnMapping {
    /// Default column names of each source's raw layout.
    pub fn for_source(source: DataSource) -> Self {
        let adj_close = match source {
            DataSource::Equity => Some("Adj Close".to_string()),
            DataSource::Crypto => None,
        };
        Self {
            date: "Date".into(),
            open: "Open".into(),
            high: "High".into(),
            low: "Low".into(),
            close: "Close".into(),
            volume: "Volume".into(),
            adj_close,
        }
    }

    pub fn with_overrides(mut self, names: &ColumnNames) -> Self {
        let apply = |slot: &mut String, name: &Option<String>| {
            if let Some(name) = name {
                *slot = name.clone();
            }
        };
        apply(&mut self.date, &names.datetime);
        apply(&mut self.open, &names.open);
        apply(&mut self.high, &names.high);
        apply(&mut self.low, &names.low);
        apply(&mut self.close, &names.close);
        apply(&mut self.volume, &names.volume);
        if let Some(adj) = &names.adj_close {
            self.adj_close = Some(adj.clone());
        }
        self
    }
}

/// Immutable options for one parse call.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub columns: ColumnMapping,
    pub daily_bar_time: NaiveTime,
    pub frequency: Frequency,
    pub timezone: Tz,
    pub sanitize: bool,
    pub skip_malformed: bool,
}

impl ParseOptions {
    pub fn for_source(source: DataSource, timezone: Tz) -> Self {
        Self {
            columns: ColumnMapping::for_source(source),
            daily_bar_time: NaiveTime::MIN,
            frequency: Frequency::Day,
            timezone,
            sanitize: false,
            skip_malformed: false,
        }
    }
}

/// Parsed bars plus row-policy counters.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub bars: Vec<Bar>,
    /// Malformed rows dropped under `skip_malformed`.
    pub skipped: usize,
    /// Rows whose extremes were widened under `sanitize`.
    pub repaired: usize,
}

struct ColumnIndex {
    date: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
    adj_close: Option<usize>,
}

pub struct BarParser;

impl BarParser {
    pub fn parse(raw: &[u8], opts: &ParseOptions) -> Result<ParseOutcome, DataError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(raw);

        let headers = reader
            .headers()
            .map_err(|e| DataError::SchemaMismatch(format!("unreadable header: {e}")))?
            .clone();
        let index = resolve_columns(&headers, &opts.columns)?;

        let mut outcome = ParseOutcome::default();
        for record in reader.byte_records() {
            let record = match record.map_err(read_failure).and_then(decode_row) {
                Ok(r) => r,
                Err(err) => {
                    if opts.skip_malformed {
                        outcome.skipped += 1;
                        continue;
                    }
                    return Err(err);
                }
            };
            if record.iter().all(str::is_empty) {
                continue;
            }

            match parse_row(&record, &index, opts) {
                Ok((bar, repaired)) => {
                    if repaired {
                        outcome.repaired += 1;
                    }
                    outcome.bars.push(bar);
                }
                Err(reason) => {
                    if opts.skip_malformed {
                        outcome.skipped += 1;
                        continue;
                    }
                    return Err(DataError::MalformedBar {
                        line: record.position().map(|p| p.line()).unwrap_or(0),
                        row: record.iter().collect::<Vec<_>>().join(","),
                        reason,
                    });
                }
            }
        }

        outcome.bars.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(outcome)
    }
}

/// Rows are read as bytes so that a row with invalid UTF-8 can still be
/// reported with its (lossily decoded) content.
fn decode_row(raw: csv::ByteRecord) -> Result<csv::StringRecord, DataError> {
    csv::StringRecord::from_byte_record(raw).map_err(|e| {
        let reason = format!("invalid UTF-8: {}", e.utf8_error());
        let raw = e.into_byte_record();
        DataError::MalformedBar {
            line: raw.position().map(|p| p.line()).unwrap_or(0),
            row: lossy_row(&raw),
            reason,
        }
    })
}

/// A read error carries no record to show.
fn read_failure(e: csv::Error) -> DataError {
    DataError::MalformedBar {
        line: e.position().map(|p| p.line()).unwrap_or(0),
        row: String::new(),
        reason: e.to_string(),
    }
}

fn lossy_row(raw: &csv::ByteRecord) -> String {
    raw.iter()
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(",")
}

fn resolve_columns(
    headers: &csv::StringRecord,
    columns: &ColumnMapping,
) -> Result<ColumnIndex, DataError> {
    let positions: HashMap<&str, usize> = headers.iter().enumerate().map(|(i, h)| (h, i)).collect();
    let required = |name: &str| {
        positions.get(name).copied().ok_or_else(|| {
            DataError::SchemaMismatch(format!(
                "missing column '{name}' (found: {})",
                headers.iter().collect::<Vec<_>>().join(", ")
            ))
        })
    };
    Ok(ColumnIndex {
        date: required(&columns.date)?,
        open: required(&columns.open)?,
        high: required(&columns.high)?,
        low: required(&columns.low)?,
        close: required(&columns.close)?,
        volume: required(&columns.volume)?,
        adj_close: columns
            .adj_close
            .as_deref()
            .and_then(|name| positions.get(name).copied()),
    })
}

fn parse_row(
    record: &csv::StringRecord,
    index: &ColumnIndex,
    opts: &ParseOptions,
) -> Result<(Bar, bool), String> {
    let cell = |i: usize| record.get(i).unwrap_or_default();
    let number = |i: usize, field: &str| -> Result<f64, String> {
        let text = cell(i);
        if text.is_empty() {
            return Err(format!("{field} is empty"));
        }
        text.parse::<f64>()
            .map_err(|_| format!("{field} '{text}' is not a number"))
    };

    let date_text = cell(index.date);
    let date = NaiveDate::parse_from_str(date_text, DATE_FORMAT)
        .map_err(|_| format!("date '{date_text}' is not YYYY-MM-DD"))?;
    let timestamp = opts
        .timezone
        .from_local_datetime(&date.and_time(opts.daily_bar_time))
        .earliest()
        .ok_or_else(|| format!("{date} {} does not exist in {}", opts.daily_bar_time, opts.timezone))?;

    let open = number(index.open, "open")?;
    let high = number(index.high, "high")?;
    let low = number(index.low, "low")?;
    let close = number(index.close, "close")?;
    let volume = number(index.volume, "volume")?;
    let adj_close = match index.adj_close {
        Some(i) if !cell(i).is_empty() => number(i, "adj_close")?,
        _ => close,
    };

    if opts.sanitize {
        let repaired = Bar::needs_repair(open, high, low, close);
        let bar = Bar::sanitized(
            timestamp,
            open,
            high,
            low,
            close,
            adj_close,
            volume,
            opts.frequency,
        )
        .map_err(|e| e.to_string())?;
        Ok((bar, repaired))
    } else {
        let bar = Bar::new(
            timestamp,
            open,
            high,
            low,
            close,
            adj_close,
            volume,
            opts.frequency,
        )
        .map_err(|e| e.to_string())?;
        Ok((bar, false))
    }
}

/// Write bars as canonical CSV (`Date,Open,High,Low,Close,Adj Close,Volume`).
///
/// Dates are the bars' local dates; numbers use the shortest text that
/// parses back to the same `f64`.
pub fn encode_canonical(bars: &[Bar]) -> Result<Vec<u8>, DataError> {
    encode_into(Vec::new(), bars)
}

fn encode_into<W: std::io::Write>(sink: W, bars: &[Bar]) -> Result<W, DataError> {
    let mut writer = csv::Writer::from_writer(sink);
    let encode_err = |e: csv::Error| DataError::EncodeFailure(e.to_string());
    writer.write_record(CANONICAL_HEADER).map_err(encode_err)?;
    for bar in bars {
        writer
            .write_record([
                bar.timestamp.date_naive().format(DATE_FORMAT).to_string(),
                bar.open.to_string(),
                bar.high.to_string(),
                bar.low.to_string(),
                bar.close.to_string(),
                bar.adj_close.to_string(),
                bar.volume.to_string(),
            ])
            .map_err(encode_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| DataError::EncodeFailure(format!("flush: {}", e.error())))
}
