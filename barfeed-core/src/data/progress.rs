//! Injected logging/progress capability for the acquisition pipeline.
//!
//! The orchestrator and the adapters never reach for a global logger; they
//! report through an `AcquisitionEvents` handed to them by the caller.
//! `TracingEvents` forwards everything to `tracing`.

use super::orchestrator::{AcquisitionReport, PairKey, PairPhase};
use super::provider::DataError;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Callbacks for acquisition progress. Every method has a no-op default.
pub trait AcquisitionEvents: Send + Sync {
    /// The storage root did not exist and was created.
    fn on_storage_created(&self, _root: &Path) {}

    /// A (year, instrument) pair entered a new phase.
    fn on_phase(&self, _pair: &PairKey, _phase: PairPhase) {}

    /// A pair is served from an existing cache file.
    fn on_cache_hit(&self, _pair: &PairKey, _path: &Path) {}

    /// A pair is about to be downloaded into `path`.
    fn on_download(&self, _pair: &PairKey, _path: &Path) {}

    /// An HTTP request is retried after `delay`.
    fn on_retry(
        &self,
        _pair: Option<&PairKey>,
        _url: &str,
        _attempt: u32,
        _delay: Duration,
        _reason: &str,
    ) {
    }

    /// Rows were dropped or repaired while parsing a pair's file.
    fn on_rows_adjusted(&self, _pair: &PairKey, _skipped: usize, _repaired: usize) {}

    /// A pair failed and was skipped because errors are tolerated.
    fn on_skip(&self, _pair: &PairKey, _error: &DataError) {}

    /// A pair's bars were appended to the feed.
    fn on_pair_complete(&self, _pair: &PairKey, _added: usize, _duplicates: usize) {}

    /// Free-form warning from an adapter or cache component.
    fn on_warning(&self, _pair: Option<&PairKey>, _message: &str) {}

    /// The whole run finished.
    fn on_run_complete(&self, _report: &AcquisitionReport) {}
}

/// Forwards acquisition events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl AcquisitionEvents for TracingEvents {
    fn on_storage_created(&self, root: &Path) {
        info!(storage = %root.display(), "created storage directory");
    }

    fn on_phase(&self, pair: &PairKey, phase: PairPhase) {
        debug!(
            instrument = %pair.instrument,
            year = pair.year,
            source = %pair.source,
            ?phase,
            "pair phase"
        );
    }

    fn on_cache_hit(&self, pair: &PairKey, path: &Path) {
        debug!(
            instrument = %pair.instrument,
            year = pair.year,
            source = %pair.source,
            path = %path.display(),
            "cache hit"
        );
    }

    fn on_download(&self, pair: &PairKey, path: &Path) {
        info!(
            instrument = %pair.instrument,
            year = pair.year,
            source = %pair.source,
            path = %path.display(),
            "downloading"
        );
    }

    fn on_retry(
        &self,
        pair: Option<&PairKey>,
        url: &str,
        attempt: u32,
        delay: Duration,
        reason: &str,
    ) {
        match pair {
            Some(pair) => warn!(
                instrument = %pair.instrument,
                year = pair.year,
                source = %pair.source,
                url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason,
                "retrying request"
            ),
            None => warn!(
                url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason,
                "retrying request"
            ),
        }
    }

    fn on_rows_adjusted(&self, pair: &PairKey, skipped: usize, repaired: usize) {
        warn!(
            instrument = %pair.instrument,
            year = pair.year,
            source = %pair.source,
            skipped,
            repaired,
            "malformed rows handled"
        );
    }

    fn on_skip(&self, pair: &PairKey, error: &DataError) {
        error!(
            instrument = %pair.instrument,
            year = pair.year,
            source = %pair.source,
            error = %error,
            "skipping pair"
        );
    }

    fn on_pair_complete(&self, pair: &PairKey, added: usize, duplicates: usize) {
        debug!(
            instrument = %pair.instrument,
            year = pair.year,
            added,
            duplicates,
            "bars appended"
        );
    }

    fn on_warning(&self, pair: Option<&PairKey>, message: &str) {
        match pair {
            Some(pair) => warn!(instrument = %pair.instrument, year = pair.year, "{message}"),
            None => warn!("{message}"),
        }
    }

    fn on_run_complete(&self, report: &AcquisitionReport) {
        info!(
            appended = report.appended(),
            skipped = report.skipped(),
            downloads = report.downloads,
            cache_hits = report.cache_hits,
            "acquisition complete"
        );
    }
}
