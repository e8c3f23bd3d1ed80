//! Acquisition orchestrator: cache-or-download, parse, assemble.
//!
//! For every (year, instrument) pair, in year-major order:
//!
//! ```text
//! CheckCache ──hit──────────────────────────► Parse ──► Append
//!     │                                         ▲
//!     └─miss/forced──► Fetch ──► Store ─────────┘
//!
//! any error ──► Failed ──skip_errors──► Skipped (continue)
//!                   └────────────────────► abort run
//! ```
//!
//! `Cancelled` and storage-root failures always abort.
//!
//! The source's frequency support is checked before the cache is consulted.
//! Payloads are daily rows; the row policy applies to them, and weekly runs
//! resample the surviving daily bars into Sunday-anchored weeks.

use super::cache::LocalCache;
use super::coinmarketcap::CryptoAdapter;
use super::feed::{Feed, FeedAssembler};
use super::http::{CancelToken, HttpFetcher};
use super::parser::BarParser;
use super::progress::AcquisitionEvents;
use super::provider::{DataError, FetchRequest, FetchWindow, SourceRouter};
use super::slugs::SlugDirectory;
use super::yahoo::EquityAdapter;
use crate::config::AcquisitionConfig;
use crate::domain::{resample_weekly, DataSource, Frequency, Instrument};
use std::fmt;
use std::sync::Arc;

/// One unit of work: an instrument for one calendar year.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub instrument: Instrument,
    pub year: i32,
    pub source: DataSource,
}

impl PairKey {
    pub fn new(instrument: Instrument, year: i32) -> Self {
        let source = instrument.datasource();
        Self {
            instrument,
            year,
            source,
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.instrument, self.year, self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairPhase {
    CheckCache,
    Fetch,
    Store,
    Parse,
    Append,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    Appended {
        from_cache: bool,
        bars: usize,
        duplicates: usize,
        skipped_rows: usize,
        repaired_rows: usize,
    },
    Skipped {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairResult {
    pub pair: PairKey,
    pub outcome: PairOutcome,
}

/// Per-pair outcomes of one run plus network/cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub pairs: Vec<PairResult>,
    /// Successful remote fetches.
    pub downloads: usize,
    pub cache_hits: usize,
}

impl AcquisitionReport {
    pub fn appended(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| matches!(p.outcome, PairOutcome::Appended { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.pairs.len() - self.appended()
    }

    /// Skipped pairs with their error text.
    pub fn failures(&self) -> impl Iterator<Item = (&PairKey, &str)> + '_ {
        self.pairs.iter().filter_map(|p| match &p.outcome {
            PairOutcome::Skipped { error } => Some((&p.pair, error.as_str())),
            PairOutcome::Appended { .. } => None,
        })
    }
}

/// A finished run.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub feed: Feed,
    pub report: AcquisitionReport,
}

pub struct AcquisitionOrchestrator {
    cache: LocalCache,
    router: SourceRouter,
    events: Arc<dyn AcquisitionEvents>,
    cancel: CancelToken,
}

impl AcquisitionOrchestrator {
    pub fn new(
        cache: LocalCache,
        router: SourceRouter,
        events: Arc<dyn AcquisitionEvents>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            cache,
            router,
            events,
            cancel,
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn run(&self, config: &AcquisitionConfig) -> Result<Acquisition, DataError> {
        if self.cache.ensure_root()? {
            self.events.on_storage_created(self.cache.root());
        }

        let mut assembler = FeedAssembler::new(config.frequency, config.duplicate_policy);
        let mut report = AcquisitionReport::default();

        for year in config.from_year..=config.to_year {
            for instrument in &config.instruments {
                self.cancel.check()?;
                let pair = PairKey::new(instrument.clone(), year);

                match self.process_pair(&pair, config, &mut assembler, &mut report) {
                    Ok(outcome) => report.pairs.push(PairResult { pair, outcome }),
                    Err(DataError::Cancelled) => return Err(DataError::Cancelled),
                    Err(e) => {
                        self.events.on_phase(&pair, PairPhase::Failed);
                        if !config.skip_errors {
                            return Err(e);
                        }
                        self.events.on_phase(&pair, PairPhase::Skipped);
                        self.events.on_skip(&pair, &e);
                        report.pairs.push(PairResult {
                            pair,
                            outcome: PairOutcome::Skipped {
                                error: e.to_string(),
                            },
                        });
                    }
                }
            }
        }

        self.events.on_run_complete(&report);
        Ok(Acquisition {
            feed: assembler.finish(),
            report,
        })
    }

    fn process_pair(
        &self,
        pair: &PairKey,
        config: &AcquisitionConfig,
        assembler: &mut FeedAssembler,
        report: &mut AcquisitionReport,
    ) -> Result<PairOutcome, DataError> {
        let events = self.events.as_ref();
        let adapter = self.router.adapter_for(pair.source);
        if !adapter.supports(config.frequency) {
            return Err(DataError::UnsupportedFrequency {
                data_source: pair.source,
                frequency: config.frequency,
            });
        }
        let window = FetchWindow::for_year(pair.year, config.frequency).ok_or_else(|| {
            DataError::SchemaMismatch(format!("year {} is out of range", pair.year))
        })?;

        events.on_phase(pair, PairPhase::CheckCache);
        let path = self
            .cache
            .path(&pair.instrument, pair.year, pair.source, config.frequency);

        let from_cache = self.cache.has(&path) && !config.force_download;
        let raw = if from_cache {
            events.on_cache_hit(pair, &path);
            report.cache_hits += 1;
            self.cache.read(&path)?
        } else {
            events.on_phase(pair, PairPhase::Fetch);
            events.on_download(pair, &path);
            let raw = adapter.fetch_raw_range(&FetchRequest {
                pair,
                window,
                events,
                cancel: &self.cancel,
            })?;
            report.downloads += 1;

            events.on_phase(pair, PairPhase::Store);
            self.cache.store(&path, &raw)?;
            raw
        };

        events.on_phase(pair, PairPhase::Parse);
        let parsed = BarParser::parse(&raw, &config.parse_options(&pair.instrument))?;
        if parsed.skipped > 0 || parsed.repaired > 0 {
            events.on_rows_adjusted(pair, parsed.skipped, parsed.repaired);
        }

        let mut daily = parsed.bars;
        let before = daily.len();
        daily.retain(|bar| window.contains(bar.timestamp.date_naive()));
        if daily.len() < before {
            events.on_warning(
                Some(pair),
                &format!(
                    "dropped {} rows dated outside {}..={}",
                    before - daily.len(),
                    window.start,
                    window.last_day()
                ),
            );
        }
        let bars = match config.frequency {
            Frequency::Day => daily,
            Frequency::Week => resample_weekly(&daily),
        };

        events.on_phase(pair, PairPhase::Append);
        let bar_count = bars.len();
        let appended = assembler.add_bars(&pair.instrument, bars);
        events.on_pair_complete(pair, appended.added, appended.duplicates);

        Ok(PairOutcome::Appended {
            from_cache,
            bars: bar_count,
            duplicates: appended.duplicates,
            skipped_rows: parsed.skipped,
            repaired_rows: parsed.repaired,
        })
    }
}

/// The production router: Yahoo for equities, CoinMarketCap for crypto,
/// sharing one HTTP client and a slug directory under the storage root.
pub fn remote_router(config: &AcquisitionConfig) -> Result<SourceRouter, DataError> {
    let fetcher = Arc::new(HttpFetcher::new(config.retry.clone())?);
    let slugs = Arc::new(SlugDirectory::new(
        &config.endpoints.crypto_base,
        &config.storage,
        config.slugs.clone(),
    ));
    Ok(SourceRouter::new(
        Box::new(EquityAdapter::new(
            config.endpoints.equity_base.as_str(),
            Arc::clone(&fetcher),
        )),
        Box::new(CryptoAdapter::new(
            config.endpoints.crypto_base.as_str(),
            fetcher,
            slugs,
        )),
    ))
}

/// Acquire a feed with the remote adapters described by `config`.
pub fn build_feed(
    config: &AcquisitionConfig,
    events: Arc<dyn AcquisitionEvents>,
) -> Result<Acquisition, DataError> {
    let orchestrator = AcquisitionOrchestrator::new(
        LocalCache::new(&config.storage),
        remote_router(config)?,
        events,
        CancelToken::new(),
    );
    orchestrator.run(config)
}
