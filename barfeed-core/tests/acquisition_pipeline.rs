//! Integration tests for the acquisition pipeline with scripted adapters.
//!
//! Tests:
//! 1. Routing by exchange (NYSEARCA → equity, everything else → crypto)
//! 2. Cache naming and idempotent reruns with zero adapter calls
//! 3. Force download refetches
//! 4. Error isolation with skip_errors, abort without it
//! 5. Cancellation always aborts
//! 6. Malformed-row policy and phase ordering
//! 7. Weekly runs: frequency support, separate cache entries, row policy
//! 8. Rows outside the fetch window never reach the feed

use barfeed_core::data::{
    AcquisitionEvents, AcquisitionOrchestrator, AcquisitionReport, CancelToken, DataError,
    FetchRequest, LocalCache, PairKey, PairOutcome, PairPhase, SourceAdapter, SourceRouter,
};
use barfeed_core::domain::{DataSource, Exchange, Frequency, Instrument};
use barfeed_core::AcquisitionConfig;
use chrono::{Duration, NaiveDate};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Script {
    Fail,
    Cancel,
    Malformed,
    /// Adds rows dated just before and just after the window.
    Spill,
}

/// Adapter that synthesizes daily rows at the start of every window (five
/// for daily windows, two whole weeks for weekly ones) and records each call
/// as "SYMBOL year".
struct ScriptedAdapter {
    source: DataSource,
    weekly: bool,
    scripts: HashMap<String, Script>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedAdapter {
    fn new(source: DataSource, calls: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            source,
            weekly: source == DataSource::Crypto,
            scripts: HashMap::new(),
            calls,
        }
    }

    fn script(mut self, symbol: &str, script: Script) -> Self {
        self.scripts.insert(symbol.to_string(), script);
        self
    }
}

impl SourceAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn source(&self) -> DataSource {
        self.source
    }

    fn supports(&self, frequency: Frequency) -> bool {
        frequency == Frequency::Day || self.weekly
    }

    fn fetch_raw_range(&self, request: &FetchRequest<'_>) -> Result<Vec<u8>, DataError> {
        let symbol = request.instrument().symbol().to_string();
        self.calls
            .lock()
            .unwrap()
            .push(format!("{symbol} {}", request.pair.year));

        let mut csv = match self.source {
            DataSource::Equity => "Date,Open,High,Low,Close,Adj Close,Volume\n".to_string(),
            DataSource::Crypto => "Date,Open,High,Low,Close,Volume,Market Cap\n".to_string(),
        };
        let days = match request.window.frequency {
            Frequency::Day => 5,
            Frequency::Week => 14,
        };
        let row = |date: NaiveDate, close: f64| {
            let tail = match self.source {
                DataSource::Equity => format!("{close},1000"),
                DataSource::Crypto => format!("1000,{}", close * 1e6),
            };
            format!(
                "{},{},{},{},{close},{tail}\n",
                date.format("%Y-%m-%d"),
                close - 0.5,
                close + 1.0,
                close - 1.0,
            )
        };
        for i in 0..days {
            csv.push_str(&row(
                request.window.start + Duration::days(i),
                100.0 + i as f64,
            ));
        }

        match self.scripts.get(&symbol) {
            None => Ok(csv.into_bytes()),
            Some(Script::Fail) => Err(DataError::NetworkFailure {
                url: format!("scripted://{symbol}"),
                status: Some(503),
                reason: "HTTP 503 Service Unavailable".into(),
            }),
            Some(Script::Cancel) => Err(DataError::Cancelled),
            Some(Script::Malformed) => {
                csv.push_str("2020-06-01,abc,1,1,1,1,1\n");
                Ok(csv.into_bytes())
            }
            Some(Script::Spill) => {
                csv.push_str(&row(request.window.start - Duration::days(1), 50.0));
                csv.push_str(&row(request.window.last_day() + Duration::days(1), 50.0));
                Ok(csv.into_bytes())
            }
        }
    }
}

#[derive(Default)]
struct RecordingEvents {
    phases: Mutex<Vec<(String, PairPhase)>>,
    skips: Mutex<Vec<(String, String)>>,
    storage_created: Mutex<bool>,
    warnings: Mutex<Vec<String>>,
    completed: Mutex<Option<AcquisitionReport>>,
}

impl AcquisitionEvents for RecordingEvents {
    fn on_storage_created(&self, _root: &Path) {
        *self.storage_created.lock().unwrap() = true;
    }

    fn on_phase(&self, pair: &PairKey, phase: PairPhase) {
        self.phases.lock().unwrap().push((pair.to_string(), phase));
    }

    fn on_skip(&self, pair: &PairKey, error: &DataError) {
        self.skips
            .lock()
            .unwrap()
            .push((pair.to_string(), error.to_string()));
    }

    fn on_warning(&self, _pair: Option<&PairKey>, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }

    fn on_run_complete(&self, report: &AcquisitionReport) {
        *self.completed.lock().unwrap() = Some(report.clone());
    }
}

struct Harness {
    equity_calls: Arc<Mutex<Vec<String>>>,
    crypto_calls: Arc<Mutex<Vec<String>>>,
    events: Arc<RecordingEvents>,
    orchestrator: AcquisitionOrchestrator,
}

fn harness(storage: &Path, scripts: &[(&str, Script)], cancel: CancelToken) -> Harness {
    let equity_calls = Arc::new(Mutex::new(Vec::new()));
    let crypto_calls = Arc::new(Mutex::new(Vec::new()));
    let mut equity = ScriptedAdapter::new(DataSource::Equity, equity_calls.clone());
    let mut crypto = ScriptedAdapter::new(DataSource::Crypto, crypto_calls.clone());
    for (symbol, script) in scripts {
        equity = equity.script(symbol, *script);
        crypto = crypto.script(symbol, *script);
    }
    let events = Arc::new(RecordingEvents::default());
    let orchestrator = AcquisitionOrchestrator::new(
        LocalCache::new(storage),
        SourceRouter::new(Box::new(equity), Box::new(crypto)),
        events.clone(),
        cancel,
    );
    Harness {
        equity_calls,
        crypto_calls,
        events,
        orchestrator,
    }
}

fn inst(text: &str) -> Instrument {
    text.parse().unwrap()
}

fn config(storage: &Path, instruments: &[&str], from: i32, to: i32) -> AcquisitionConfig {
    AcquisitionConfig::new(
        instruments.iter().map(|s| inst(s)).collect(),
        from,
        to,
        storage,
    )
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[test]
fn instruments_route_by_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[], CancelToken::new());
    let cfg = config(
        dir.path(),
        &["BTC-CRYPTO", "SPY-NYSEARCA", "XYZ-SOMEWHERE"],
        2020,
        2020,
    );

    let acquisition = h.orchestrator.run(&cfg).unwrap();

    assert_eq!(*h.equity_calls.lock().unwrap(), ["SPY 2020"]);
    assert_eq!(*h.crypto_calls.lock().unwrap(), ["BTC 2020", "XYZ 2020"]);

    let xyz = inst("XYZ-SOMEWHERE");
    assert_eq!(xyz.exchange(), &Exchange::Other("SOMEWHERE".into()));
    let bars = acquisition.feed.bars(&xyz).unwrap();
    assert_eq!(bars[0].timestamp.timezone(), chrono_tz::UTC);

    let spy = acquisition.feed.bars(&inst("SPY-NYSEARCA")).unwrap();
    assert_eq!(spy[0].timestamp.timezone(), chrono_tz::America::New_York);
}

#[test]
fn cache_files_follow_naming_and_rerun_is_offline() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &["BTC-CRYPTO", "SPY-NYSEARCA"], 2020, 2020);

    let first = harness(dir.path(), &[], CancelToken::new());
    let a = first.orchestrator.run(&cfg).unwrap();
    assert!(dir.path().join("BTC-2020-crypto.csv").is_file());
    assert!(dir.path().join("SPY-2020-equity.csv").is_file());
    assert_eq!(a.report.downloads, 2);
    assert_eq!(a.report.cache_hits, 0);

    // Every symbol fails if fetched: the rerun must never call an adapter.
    let second = harness(
        dir.path(),
        &[("BTC", Script::Fail), ("SPY", Script::Fail)],
        CancelToken::new(),
    );
    let b = second.orchestrator.run(&cfg).unwrap();
    assert!(second.equity_calls.lock().unwrap().is_empty());
    assert!(second.crypto_calls.lock().unwrap().is_empty());
    assert_eq!(b.report.downloads, 0);
    assert_eq!(b.report.cache_hits, 2);
    assert_eq!(a.feed, b.feed);
    assert_eq!(a.feed.fingerprint(), b.feed.fingerprint());
}

#[test]
fn force_download_refetches_cached_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), &["BTC-CRYPTO"], 2020, 2020);
    harness(dir.path(), &[], CancelToken::new())
        .orchestrator
        .run(&cfg)
        .unwrap();

    cfg.force_download = true;
    let h = harness(dir.path(), &[], CancelToken::new());
    let acquisition = h.orchestrator.run(&cfg).unwrap();
    assert_eq!(*h.crypto_calls.lock().unwrap(), ["BTC 2020"]);
    assert_eq!(acquisition.report.downloads, 1);
}

#[test]
fn failing_pair_is_skipped_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[("ETH", Script::Fail)], CancelToken::new());
    let mut cfg = config(
        dir.path(),
        &["BTC-CRYPTO", "ETH-CRYPTO", "SPY-NYSEARCA"],
        2020,
        2020,
    );
    cfg.skip_errors = true;

    let acquisition = h.orchestrator.run(&cfg).unwrap();

    assert_eq!(
        acquisition.feed.instruments(),
        &[inst("BTC-CRYPTO"), inst("SPY-NYSEARCA")]
    );
    assert_eq!(acquisition.report.appended(), 2);
    assert_eq!(acquisition.report.skipped(), 1);
    assert!(!dir.path().join("ETH-2020-crypto.csv").exists());

    let skips = h.events.skips.lock().unwrap();
    assert_eq!(skips.len(), 1);
    assert_eq!(skips[0].0, "ETH-CRYPTO 2020 (crypto)");
    assert!(skips[0].1.contains("503"));

    let phases = h.events.phases.lock().unwrap();
    let eth: Vec<PairPhase> = phases
        .iter()
        .filter(|(p, _)| p.starts_with("ETH"))
        .map(|(_, phase)| *phase)
        .collect();
    assert_eq!(
        eth,
        [
            PairPhase::CheckCache,
            PairPhase::Fetch,
            PairPhase::Failed,
            PairPhase::Skipped
        ]
    );

    let completed = h.events.completed.lock().unwrap();
    assert_eq!(completed.as_ref(), Some(&acquisition.report));
}

#[test]
fn failing_pair_aborts_without_skip_errors() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[("ETH", Script::Fail)], CancelToken::new());
    let cfg = config(
        dir.path(),
        &["BTC-CRYPTO", "ETH-CRYPTO", "SPY-NYSEARCA"],
        2020,
        2020,
    );

    let err = h.orchestrator.run(&cfg).unwrap_err();
    assert!(matches!(
        err,
        DataError::NetworkFailure {
            status: Some(503),
            ..
        }
    ));
    // SPY comes after the failure and is never attempted.
    assert!(h.equity_calls.lock().unwrap().is_empty());
}

#[test]
fn cancellation_aborts_even_when_skipping_errors() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[("BTC", Script::Cancel)], CancelToken::new());
    let mut cfg = config(dir.path(), &["BTC-CRYPTO", "SPY-NYSEARCA"], 2020, 2020);
    cfg.skip_errors = true;

    assert!(matches!(h.orchestrator.run(&cfg), Err(DataError::Cancelled)));
    assert!(h.equity_calls.lock().unwrap().is_empty());
}

#[test]
fn cancelled_token_stops_before_first_pair() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let h = harness(dir.path(), &[], cancel.clone());
    cancel.cancel();

    let cfg = config(dir.path(), &["BTC-CRYPTO"], 2020, 2020);
    assert!(matches!(h.orchestrator.run(&cfg), Err(DataError::Cancelled)));
    assert!(h.crypto_calls.lock().unwrap().is_empty());
}

#[test]
fn years_are_iterated_outermost() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[], CancelToken::new());
    let cfg = config(dir.path(), &["BTC-CRYPTO", "ETH-CRYPTO"], 2019, 2020);

    let acquisition = h.orchestrator.run(&cfg).unwrap();
    assert_eq!(
        *h.crypto_calls.lock().unwrap(),
        ["BTC 2019", "ETH 2019", "BTC 2020", "ETH 2020"]
    );
    let btc = acquisition.feed.bars(&inst("BTC-CRYPTO")).unwrap();
    assert_eq!(btc.len(), 10);
    assert!(btc.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[test]
fn successful_pair_walks_every_phase() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[], CancelToken::new());
    h.orchestrator
        .run(&config(dir.path(), &["SPY-NYSEARCA"], 2020, 2020))
        .unwrap();

    let phases: Vec<PairPhase> = h
        .events
        .phases
        .lock()
        .unwrap()
        .iter()
        .map(|(_, p)| *p)
        .collect();
    assert_eq!(
        phases,
        [
            PairPhase::CheckCache,
            PairPhase::Fetch,
            PairPhase::Store,
            PairPhase::Parse,
            PairPhase::Append
        ]
    );
}

#[test]
fn storage_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("nested/storage");
    let h = harness(&storage, &[], CancelToken::new());
    h.orchestrator
        .run(&config(&storage, &["BTC-CRYPTO"], 2020, 2020))
        .unwrap();
    assert!(*h.events.storage_created.lock().unwrap());
    assert!(storage.join("BTC-2020-crypto.csv").is_file());
}

#[test]
fn malformed_rows_follow_row_policy() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[("SPY", Script::Malformed)], CancelToken::new());
    let mut cfg = config(dir.path(), &["SPY-NYSEARCA"], 2020, 2020);
    cfg.skip_malformed_bars = true;

    let acquisition = h.orchestrator.run(&cfg).unwrap();
    match &acquisition.report.pairs[0].outcome {
        PairOutcome::Appended {
            bars, skipped_rows, ..
        } => {
            assert_eq!(*bars, 5);
            assert_eq!(*skipped_rows, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // Strict parsing of the now-cached file fails the pair.
    cfg.skip_malformed_bars = false;
    let strict = harness(dir.path(), &[], CancelToken::new());
    let err = strict.orchestrator.run(&cfg).unwrap_err();
    assert!(matches!(err, DataError::MalformedBar { ref row, .. } if row.contains("abc")));
}

#[test]
fn weekly_equity_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[], CancelToken::new());
    let mut cfg = config(dir.path(), &["SPY-NYSEARCA", "BTC-CRYPTO"], 2020, 2020);
    cfg.frequency = Frequency::Week;
    cfg.skip_errors = true;

    let acquisition = h.orchestrator.run(&cfg).unwrap();
    assert!(h.equity_calls.lock().unwrap().is_empty());
    let failures: Vec<_> = acquisition.report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].1.contains("does not support weekly"));

    // Two whole weeks of daily rows from Sunday 2020-01-05.
    let btc = acquisition.feed.bars(&inst("BTC-CRYPTO")).unwrap();
    assert_eq!(btc.len(), 2);
    assert!(btc.iter().all(|b| b.frequency == Frequency::Week));
    assert_eq!(btc[0].timestamp.to_rfc3339(), "2020-01-05T00:00:00+00:00");
    assert_eq!(btc[1].timestamp.to_rfc3339(), "2020-01-12T00:00:00+00:00");
    assert_eq!((btc[0].open, btc[0].close), (99.5, 106.0));
    assert_eq!((btc[0].high, btc[0].low), (107.0, 99.0));
    assert_eq!(btc[0].volume, 7000.0);
}

#[test]
fn weekly_equity_on_warm_cache_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), &["SPY-NYSEARCA"], 2020, 2020);
    harness(dir.path(), &[], CancelToken::new())
        .orchestrator
        .run(&cfg)
        .unwrap();
    assert!(dir.path().join("SPY-2020-equity.csv").is_file());

    cfg.frequency = Frequency::Week;
    let h = harness(dir.path(), &[], CancelToken::new());
    let err = h.orchestrator.run(&cfg).unwrap_err();
    assert!(matches!(
        err,
        DataError::UnsupportedFrequency {
            data_source: DataSource::Equity,
            frequency: Frequency::Week,
        }
    ));
    assert!(h.equity_calls.lock().unwrap().is_empty());
    assert!(h
        .events
        .phases
        .lock()
        .unwrap()
        .iter()
        .all(|(_, phase)| *phase != PairPhase::CheckCache));
}

#[test]
fn daily_and_weekly_runs_keep_separate_cache_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), &["BTC-CRYPTO"], 2020, 2020);
    let daily = harness(dir.path(), &[], CancelToken::new())
        .orchestrator
        .run(&cfg)
        .unwrap();
    assert_eq!(daily.feed.bar_count(), 5);

    cfg.frequency = Frequency::Week;
    let h = harness(dir.path(), &[], CancelToken::new());
    let weekly = h.orchestrator.run(&cfg).unwrap();
    assert_eq!(*h.crypto_calls.lock().unwrap(), ["BTC 2020"]);
    assert_eq!(weekly.report.downloads, 1);
    assert_eq!(weekly.report.cache_hits, 0);
    assert!(dir.path().join("weekly/BTC-2020-crypto.csv").is_file());

    let bars = weekly.feed.bars(&inst("BTC-CRYPTO")).unwrap();
    assert_eq!(bars.len(), 2);
    assert!(bars.iter().all(|b| b.frequency == Frequency::Week));
    assert!(bars
        .windows(2)
        .all(|w| w[1].timestamp - w[0].timestamp >= chrono::Duration::days(7)));

    // Both entries now serve their own run offline.
    for frequency in [Frequency::Day, Frequency::Week] {
        cfg.frequency = frequency;
        let offline = harness(dir.path(), &[("BTC", Script::Fail)], CancelToken::new());
        let rerun = offline.orchestrator.run(&cfg).unwrap();
        assert_eq!(rerun.report.cache_hits, 1);
        assert!(rerun
            .feed
            .bars(&inst("BTC-CRYPTO"))
            .unwrap()
            .iter()
            .all(|b| b.frequency == frequency));
    }
}

#[test]
fn weekly_rows_follow_row_policy() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[("BTC", Script::Malformed)], CancelToken::new());
    let mut cfg = config(dir.path(), &["BTC-CRYPTO"], 2020, 2020);
    cfg.frequency = Frequency::Week;

    let err = h.orchestrator.run(&cfg).unwrap_err();
    match err {
        DataError::MalformedBar { row, .. } => assert!(row.starts_with("2020-06-01,abc"), "{row}"),
        other => panic!("unexpected error: {other}"),
    }

    cfg.skip_malformed_bars = true;
    let acquisition = harness(dir.path(), &[], CancelToken::new())
        .orchestrator
        .run(&cfg)
        .unwrap();
    match &acquisition.report.pairs[0].outcome {
        PairOutcome::Appended {
            bars, skipped_rows, ..
        } => {
            assert_eq!(*bars, 2);
            assert_eq!(*skipped_rows, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn rows_outside_the_window_are_dropped() {
    for frequency in [Frequency::Day, Frequency::Week] {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), &[("BTC", Script::Spill)], CancelToken::new());
        let mut cfg = config(dir.path(), &["BTC-CRYPTO"], 2020, 2020);
        cfg.frequency = frequency;

        let acquisition = h.orchestrator.run(&cfg).unwrap();
        let bars = acquisition.feed.bars(&inst("BTC-CRYPTO")).unwrap();
        let expected = match frequency {
            Frequency::Day => 5,
            Frequency::Week => 2,
        };
        assert_eq!(bars.len(), expected);
        assert!(bars.iter().all(|b| b.low > 50.0));
        let warnings = h.events.warnings.lock().unwrap();
        assert!(warnings.iter().any(|w| w.contains("dropped 2 rows")), "{warnings:?}");
    }
}
