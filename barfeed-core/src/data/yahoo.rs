//! Equity adapter backed by Yahoo Finance's v8 chart API.
//!
//! Fetches daily bars for one calendar window and flattens the JSON envelope
//! into CSV `Date,Open,High,Low,Close,Adj Close,Volume`.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes; anything unexpected in the envelope surfaces as `SchemaMismatch`.

use super::http::HttpFetcher;
use super::provider::{DataError, FetchRequest, FetchWindow, SourceAdapter};
use super::table::RawTable;
use crate::domain::{DataSource, Frequency};
use chrono::{Duration, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::Deserialize;
use std::sync::Arc;

pub const DEFAULT_EQUITY_BASE: &str = "https://query2.finance.yahoo.com";

const OUTPUT_HEADER: [&str; 7] = ["Date", "Open", "High", "Low", "Close", "Adj Close", "Volume"];

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

pub struct EquityAdapter {
    base_url: String,
    fetcher: Arc<HttpFetcher>,
}

impl EquityAdapter {
    pub fn new(base_url: impl Into<String>, fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
        }
    }

    /// Chart API URL covering the window in the instrument's timezone.
    pub fn chart_url(&self, ticker: &str, window: &FetchWindow, tz: Tz) -> String {
        let start = window.start.and_time(NaiveTime::MIN);
        let end = window.last_day().and_time(NaiveTime::MIN) + Duration::seconds(86_399);
        format!(
            "{}/v8/finance/chart/{ticker}?period1={}&period2={}&interval=1d&includeAdjustedClose=true",
            self.base_url,
            local_timestamp(tz, start),
            local_timestamp(tz, end),
        )
    }
}

fn local_timestamp(tz: Tz, local: NaiveDateTime) -> i64 {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| local.and_utc().timestamp())
}

/// Flatten a chart response into the raw CSV table.
///
/// Rows with every OHLCV value null are holidays and are dropped; partially
/// null rows keep empty cells so the parser's row policy decides.
fn parse_response(body: &str, window: &FetchWindow, tz: Tz) -> Result<RawTable, DataError> {
    let resp: ChartResponse = serde_json::from_str(body)
        .map_err(|e| DataError::SchemaMismatch(format!("unexpected chart response: {e}")))?;

    if let Some(err) = resp.chart.error {
        return Err(DataError::SchemaMismatch(format!(
            "{}: {}",
            err.code,
            err.description.unwrap_or_default()
        )));
    }

    let data = resp
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| DataError::SchemaMismatch("result array is empty".into()))?;

    let timestamps = data
        .timestamp
        .ok_or_else(|| DataError::SchemaMismatch("no timestamps".into()))?;

    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| DataError::SchemaMismatch("no quote data".into()))?;

    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose)
        .ok_or_else(|| DataError::SchemaMismatch("no adjusted close data".into()))?;

    let mut table = RawTable::new(OUTPUT_HEADER);
    for (i, &ts) in timestamps.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.with_timezone(&tz).date_naive())
            .ok_or_else(|| DataError::SchemaMismatch(format!("invalid timestamp: {ts}")))?;
        if !window.contains(date) {
            continue;
        }

        let at = |series: &[Option<f64>]| series.get(i).copied().flatten();
        let open = at(&quote.open);
        let high = at(&quote.high);
        let low = at(&quote.low);
        let close = at(&quote.close);
        let volume = at(&quote.volume);

        if [open, high, low, close, volume].iter().all(Option::is_none) {
            continue;
        }

        table.push_row(vec![
            date.format("%Y-%m-%d").to_string(),
            cell(open),
            cell(high),
            cell(low),
            cell(close),
            cell(at(&adj_closes)),
            cell(volume),
        ]);
    }
    Ok(table)
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl SourceAdapter for EquityAdapter {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn source(&self) -> DataSource {
        DataSource::Equity
    }

    fn supports(&self, frequency: Frequency) -> bool {
        frequency == Frequency::Day
    }

    fn fetch_raw_range(&self, request: &FetchRequest<'_>) -> Result<Vec<u8>, DataError> {
        if !self.supports(request.window.frequency) {
            return Err(DataError::UnsupportedFrequency {
                data_source: DataSource::Equity,
                frequency: request.window.frequency,
            });
        }
        let instrument = request.instrument();
        let tz = instrument.timezone();
        let url = self.chart_url(&instrument.normalized_ticker(), &request.window, tz);
        let body = self.fetcher.get_text(&url, request.context())?;
        let table = parse_response(&body, &request.window, tz)?;
        if table.is_empty() {
            request
                .events
                .on_warning(Some(request.pair), "chart response contained no trading days");
        }
        table.to_csv()
    }
}
