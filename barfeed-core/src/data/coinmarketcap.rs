//! Crypto adapter backed by CoinMarketCap's historical-data pages.
//!
//! There is no JSON endpoint: the page is HTML and the daily history is one
//! of several tables on it. We pick it by shape (seven columns, more than a
//! threshold of body rows) and clean it up into
//! CSV `Date,Open,High,Low,Close,Volume,Market Cap`.
//!
//! The payload is always daily rows limited to the requested window. Weekly
//! bars are not offered by the provider; they are resampled from the parsed
//! daily bars downstream.

use super::http::HttpFetcher;
use super::provider::{DataError, FetchRequest, FetchWindow, SourceAdapter};
use super::slugs::{selector, SlugDirectory};
use super::table::RawTable;
use crate::domain::{DataSource, Frequency};
use chrono::NaiveDate;
use scraper::{ElementRef, Html};
use std::sync::Arc;

pub const DEFAULT_CRYPTO_BASE: &str = "https://coinmarketcap.com";

const PAGE_DATE_FORMAT: &str = "%b %d, %Y";
const ROW_DATE_FORMAT: &str = "%Y-%m-%d";

/// Shape a table must have to be taken for the daily history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableShape {
    pub columns: usize,
    /// Body rows must exceed this (capped by the window length).
    pub min_rows: usize,
}

impl Default for TableShape {
    fn default() -> Self {
        Self {
            columns: 7,
            min_rows: 30,
        }
    }
}

pub struct CryptoAdapter {
    base_url: String,
    fetcher: Arc<HttpFetcher>,
    slugs: Arc<SlugDirectory>,
    shape: TableShape,
}

impl CryptoAdapter {
    pub fn new(
        base_url: impl Into<String>,
        fetcher: Arc<HttpFetcher>,
        slugs: Arc<SlugDirectory>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
            slugs,
            shape: TableShape::default(),
        }
    }

    pub fn with_shape(mut self, shape: TableShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn slugs(&self) -> &SlugDirectory {
        &self.slugs
    }

    pub fn historical_url(&self, slug: &str, window: &FetchWindow) -> String {
        format!(
            "{}/currencies/{slug}/historical-data/?start={}&end={}",
            self.base_url,
            window.start.format("%Y%m%d"),
            window.last_day().format("%Y%m%d"),
        )
    }
}

impl SourceAdapter for CryptoAdapter {
    fn name(&self) -> &str {
        "coinmarketcap"
    }

    fn source(&self) -> DataSource {
        DataSource::Crypto
    }

    fn supports(&self, _frequency: Frequency) -> bool {
        true
    }

    fn fetch_raw_range(&self, request: &FetchRequest<'_>) -> Result<Vec<u8>, DataError> {
        let ctx = request.context();
        let slug = self
            .slugs
            .lookup(request.instrument().symbol(), &self.fetcher, ctx)?;
        let url = self.historical_url(&slug, &request.window);
        let html = self.fetcher.get_text(&url, ctx)?;
        extract_history(&html, self.shape, &request.window)?.to_csv()
    }
}

/// Find the single history table on the page, clean it and keep the rows
/// dated inside `window`.
///
/// Rows whose date cannot be read are kept so the parser's row policy
/// decides about them.
pub fn extract_history(html: &str, shape: TableShape, window: &FetchWindow) -> Result<RawTable, DataError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let min_rows = shape.min_rows.min(window.days().saturating_sub(1));

    let candidates: Vec<RawTable> = document
        .select(&table_sel)
        .map(read_table)
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|t| t.headers.len() == shape.columns && t.rows.len() > min_rows)
        .collect();

    let mut table = match <[RawTable; 1]>::try_from(candidates) {
        Ok([table]) => table,
        Err(candidates) => {
            return Err(DataError::SchemaMismatch(format!(
                "expected exactly one {}-column history table with more than {min_rows} rows, found {}",
                shape.columns,
                candidates.len()
            )))
        }
    };

    clean_table(&mut table);
    if let Some(date_col) = table.column_index("Date") {
        table.rows.retain(|row| {
            row.get(date_col)
                .and_then(|text| NaiveDate::parse_from_str(text, ROW_DATE_FORMAT).ok())
                .map_or(true, |date| window.contains(date))
        });
    }
    Ok(table)
}

/// Header from the first row of `th` cells; body rows are rows of `td` cells.
fn read_table(table: ElementRef<'_>) -> Result<RawTable, DataError> {
    let row_sel = selector("tr")?;
    let th_sel = selector("th")?;
    let td_sel = selector("td")?;

    let mut headers: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for row in table.select(&row_sel) {
        if headers.is_empty() {
            let ths: Vec<String> = row.select(&th_sel).map(cell_text).collect();
            if !ths.is_empty() {
                headers = ths;
                continue;
            }
        }
        let tds: Vec<String> = row.select(&td_sel).map(cell_text).collect();
        if !tds.is_empty() {
            rows.push(tds);
        }
    }
    Ok(RawTable { headers, rows })
}

fn cell_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Strip footnote markers from headers, re-render dates, de-format numbers.
fn clean_table(table: &mut RawTable) {
    for header in &mut table.headers {
        *header = header.trim_end_matches('*').trim().to_string();
    }
    let date_col = table.column_index("Date");
    for row in &mut table.rows {
        for (i, value) in row.iter_mut().enumerate() {
            if Some(i) == date_col {
                if let Ok(date) = NaiveDate::parse_from_str(value, PAGE_DATE_FORMAT) {
                    *value = date.format(ROW_DATE_FORMAT).to_string();
                }
            } else {
                *value = clean_number(value);
            }
        }
    }
}

fn clean_number(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    if cleaned == "-" {
        String::new()
    } else {
        cleaned
    }
}
