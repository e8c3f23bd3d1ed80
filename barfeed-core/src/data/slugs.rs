//! Symbol → URL slug directory for the crypto provider.
//!
//! The historical-data page is addressed by slug (`bitcoin`), not by symbol
//! (`BTC`). The mapping is scraped from the provider's listing page and kept
//! in a side file next to the cache:
//!
//! `{storage}/crypto-slugs.json` = `{ "fetched_at": ..., "slugs": { "BTC": "bitcoin" } }`
//!
//! Lookup order: in-memory table, then the side file if younger than the TTL,
//! then a fresh scrape. A symbol missing from a table loaded from disk
//! triggers exactly one refresh before giving up.

use super::cache::write_atomic;
use super::http::HttpFetcher;
use super::provider::{DataError, FetchContext};
use chrono::{DateTime, Duration, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const SIDE_FILE_NAME: &str = "crypto-slugs.json";

/// Staleness policy for the slug side file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlugPolicy {
    pub ttl_days: u32,
    /// Ignore the side file and scrape on first use.
    pub force_refresh: bool,
}

impl Default for SlugPolicy {
    fn default() -> Self {
        Self {
            ttl_days: 7,
            force_refresh: false,
        }
    }
}

impl SlugPolicy {
    pub fn ttl(&self) -> Duration {
        Duration::days(i64::from(self.ttl_days))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SlugFile {
    fetched_at: DateTime<Utc>,
    slugs: BTreeMap<String, String>,
}

#[derive(Debug)]
struct SlugTable {
    slugs: BTreeMap<String, String>,
    /// Scraped during this run, as opposed to loaded from the side file.
    fresh: bool,
}

pub struct SlugDirectory {
    listing_url: String,
    side_file: Option<PathBuf>,
    policy: SlugPolicy,
    table: Mutex<Option<SlugTable>>,
}

impl SlugDirectory {
    /// Directory backed by `{storage}/crypto-slugs.json`.
    pub fn new(base_url: &str, storage: &Path, policy: SlugPolicy) -> Self {
        Self {
            listing_url: listing_url(base_url),
            side_file: Some(storage.join(SIDE_FILE_NAME)),
            policy,
            table: Mutex::new(None),
        }
    }

    /// Directory that never touches disk.
    pub fn in_memory(base_url: &str, policy: SlugPolicy) -> Self {
        Self {
            listing_url: listing_url(base_url),
            side_file: None,
            policy,
            table: Mutex::new(None),
        }
    }

    pub fn side_file(&self) -> Option<&Path> {
        self.side_file.as_deref()
    }

    /// Resolve `symbol` (case-insensitive) to its URL slug.
    pub fn lookup(
        &self,
        symbol: &str,
        fetcher: &HttpFetcher,
        ctx: FetchContext<'_>,
    ) -> Result<String, DataError> {
        let key = symbol.trim().to_uppercase();
        let mut guard = self.lock();
        self.ensure_table(&mut guard, fetcher, ctx)?;

        if let Some(slug) = guard.as_ref().and_then(|t| t.slugs.get(&key)) {
            return Ok(slug.clone());
        }

        if guard.as_ref().is_some_and(|t| !t.fresh) {
            ctx.events.on_warning(
                ctx.pair,
                &format!("symbol {key} not in cached slug table, refreshing"),
            );
            *guard = Some(self.scrape(fetcher, ctx)?);
            if let Some(slug) = guard.as_ref().and_then(|t| t.slugs.get(&key)) {
                return Ok(slug.clone());
            }
        }

        Err(DataError::UnknownSymbolMapping { symbol: key })
    }

    /// Make the table available (side file or scrape) without looking anything
    /// up. Returns the number of symbols known.
    pub fn load(&self, fetcher: &HttpFetcher, ctx: FetchContext<'_>) -> Result<usize, DataError> {
        let mut guard = self.lock();
        self.ensure_table(&mut guard, fetcher, ctx)?;
        Ok(guard.as_ref().map_or(0, |t| t.slugs.len()))
    }

    /// Scrape the listing page now, replacing the table and the side file.
    /// Returns the number of symbols known afterwards.
    pub fn refresh(&self, fetcher: &HttpFetcher, ctx: FetchContext<'_>) -> Result<usize, DataError> {
        let table = self.scrape(fetcher, ctx)?;
        let count = table.slugs.len();
        *self.lock() = Some(table);
        Ok(count)
    }

    /// Current in-memory table; empty until the first lookup or refresh.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock()
            .as_ref()
            .map(|t| t.slugs.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<SlugTable>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_table(
        &self,
        table: &mut Option<SlugTable>,
        fetcher: &HttpFetcher,
        ctx: FetchContext<'_>,
    ) -> Result<(), DataError> {
        if table.is_none() {
            *table = Some(match self.load_side_file(Utc::now(), ctx) {
                Some(slugs) => SlugTable { slugs, fresh: false },
                None => self.scrape(fetcher, ctx)?,
            });
        }
        Ok(())
    }

    fn scrape(&self, fetcher: &HttpFetcher, ctx: FetchContext<'_>) -> Result<SlugTable, DataError> {
        let html = fetcher.get_text(&self.listing_url, ctx)?;
        let slugs = parse_listing(&html)?;
        if let Some(path) = &self.side_file {
            let file = SlugFile {
                fetched_at: Utc::now(),
                slugs: slugs.clone(),
            };
            let json = serde_json::to_vec_pretty(&file)
                .map_err(|e| DataError::CacheWriteFailure {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            write_atomic(path, &json)?;
        }
        Ok(SlugTable { slugs, fresh: true })
    }

    /// Slugs from the side file, if present, readable and within the TTL.
    fn load_side_file(
        &self,
        now: DateTime<Utc>,
        ctx: FetchContext<'_>,
    ) -> Option<BTreeMap<String, String>> {
        if self.policy.force_refresh {
            return None;
        }
        let path = self.side_file.as_ref()?;
        let bytes = fs::read(path).ok()?;
        let file: SlugFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                ctx.events.on_warning(
                    ctx.pair,
                    &format!("ignoring unreadable slug file {}: {e}", path.display()),
                );
                return None;
            }
        };
        (now - file.fetched_at < self.policy.ttl()).then_some(file.slugs)
    }
}

fn listing_url(base_url: &str) -> String {
    format!("{}/all/views/all/", base_url.trim_end_matches('/'))
}

/// Extract `SYMBOL → slug` from the listing page.
///
/// A row counts when it has an anchor linking to `/currencies/{slug}/` and a
/// cell whose class contains `symbol`. The first row for a symbol wins.
pub fn parse_listing(html: &str) -> Result<BTreeMap<String, String>, DataError> {
    let document = Html::parse_document(html);
    let row_sel = selector("tr")?;
    let link_sel = selector("a[href]")?;
    let cell_sel = selector("td")?;

    let mut slugs = BTreeMap::new();
    for row in document.select(&row_sel) {
        let slug = row
            .select(&link_sel)
            .filter_map(|a| a.value().attr("href"))
            .find_map(slug_from_href);
        let symbol = row
            .select(&cell_sel)
            .find(|td| {
                td.value()
                    .attr("class")
                    .is_some_and(|class| class.contains("symbol"))
            })
            .map(|td| td.text().collect::<String>().trim().to_uppercase());

        if let (Some(slug), Some(symbol)) = (slug, symbol) {
            if !symbol.is_empty() {
                slugs.entry(symbol).or_insert(slug);
            }
        }
    }

    if slugs.is_empty() {
        return Err(DataError::SchemaMismatch(
            "listing page contained no symbol/slug rows".into(),
        ));
    }
    Ok(slugs)
}

fn slug_from_href(href: &str) -> Option<String> {
    let (_, rest) = href.split_once("/currencies/")?;
    let slug = rest.split('/').next()?;
    (!slug.is_empty()).then(|| slug.to_string())
}

pub(crate) fn selector(css: &str) -> Result<Selector, DataError> {
    Selector::parse(css)
        .map_err(|e| DataError::SchemaMismatch(format!("invalid selector '{css}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::http::{CancelToken, RetryPolicy};
    use crate::data::progress::TracingEvents;

    const LISTING: &str = r#"
        <table>
          <tr><th>Name</th><th>Symbol</th></tr>
          <tr>
            <td class="cmc-table__cell--sort-by__name"><a href="/currencies/bitcoin/">Bitcoin</a></td>
            <td class="cmc-table__cell--sort-by__symbol">BTC</td>
          </tr>
          <tr>
            <td><a href="https://coinmarketcap.com/currencies/ethereum/">Ethereum</a></td>
            <td class="col-symbol"> eth </td>
          </tr>
          <tr>
            <td><a href="/exchanges/binance/">Binance</a></td>
            <td class="col-symbol">BNB</td>
          </tr>
        </table>"#;

    #[test]
    fn listing_rows_map_symbols_to_slugs() {
        let slugs = parse_listing(LISTING).unwrap();
        assert_eq!(slugs.len(), 2);
        assert_eq!(slugs["BTC"], "bitcoin");
        assert_eq!(slugs["ETH"], "ethereum");
    }

    #[test]
    fn empty_listing_is_schema_mismatch() {
        let err = parse_listing("<html><body><p>maintenance</p></body></html>").unwrap_err();
        assert!(matches!(err, DataError::SchemaMismatch(_)));
    }

    #[test]
    fn href_parsing() {
        assert_eq!(slug_from_href("/currencies/bitcoin/"), Some("bitcoin".into()));
        assert_eq!(
            slug_from_href("/currencies/bitcoin/historical-data/"),
            Some("bitcoin".into())
        );
        assert_eq!(slug_from_href("/currencies/"), None);
        assert_eq!(slug_from_href("/exchanges/x/"), None);
    }

    fn write_side_file(dir: &Path, age: Duration) {
        let file = SlugFile {
            fetched_at: Utc::now() - age,
            slugs: BTreeMap::from([("BTC".to_string(), "bitcoin".to_string())]),
        };
        fs::write(dir.join(SIDE_FILE_NAME), serde_json::to_vec(&file).unwrap()).unwrap();
    }

    #[test]
    fn fresh_side_file_serves_lookup_without_network() {
        let dir = tempfile::tempdir().unwrap();
        write_side_file(dir.path(), Duration::hours(1));
        // Unroutable base: any network access would fail the lookup.
        let slugs = SlugDirectory::new("http://127.0.0.1:9", dir.path(), SlugPolicy::default());
        let fetcher = HttpFetcher::new(RetryPolicy::default()).unwrap();
        let cancel = CancelToken::new();
        let ctx = FetchContext {
            pair: None,
            events: &TracingEvents,
            cancel: &cancel,
        };
        assert_eq!(slugs.lookup("btc", &fetcher, ctx).unwrap(), "bitcoin");
        assert_eq!(slugs.snapshot().len(), 1);
    }

    #[test]
    fn stale_or_forced_side_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let ctx = FetchContext {
            pair: None,
            events: &TracingEvents,
            cancel: &cancel,
        };

        write_side_file(dir.path(), Duration::days(8));
        let slugs = SlugDirectory::new("http://x", dir.path(), SlugPolicy::default());
        assert!(slugs.load_side_file(Utc::now(), ctx).is_none());

        write_side_file(dir.path(), Duration::hours(1));
        let forced = SlugDirectory::new(
            "http://x",
            dir.path(),
            SlugPolicy {
                force_refresh: true,
                ..SlugPolicy::default()
            },
        );
        assert!(forced.load_side_file(Utc::now(), ctx).is_none());
        assert!(slugs.load_side_file(Utc::now(), ctx).is_some());
    }

    #[test]
    fn corrupt_side_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SIDE_FILE_NAME), "{not json").unwrap();
        let cancel = CancelToken::new();
        let ctx = FetchContext {
            pair: None,
            events: &TracingEvents,
            cancel: &cancel,
        };
        let slugs = SlugDirectory::new("http://x", dir.path(), SlugPolicy::default());
        assert!(slugs.load_side_file(Utc::now(), ctx).is_none());
    }

    #[test]
    fn listing_url_strips_trailing_slash() {
        assert_eq!(
            listing_url("https://coinmarketcap.com/"),
            "https://coinmarketcap.com/all/views/all/"
        );
    }
}
