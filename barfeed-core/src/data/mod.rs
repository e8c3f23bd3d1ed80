//! Data acquisition: remote adapters, local cache, parsing, feed assembly.

pub mod cache;
pub mod coinmarketcap;
pub mod feed;
pub mod http;
pub mod orchestrator;
pub mod parser;
pub mod progress;
pub mod provider;
pub mod slugs;
pub mod table;
pub mod yahoo;

pub use cache::{CacheEntry, LocalCache};
pub use coinmarketcap::{CryptoAdapter, TableShape};
pub use feed::{AppendReport, DuplicatePolicy, Feed, FeedAssembler};
pub use http::{CancelToken, HttpFetcher, RetryPolicy};
pub use orchestrator::{
    build_feed, remote_router, Acquisition, AcquisitionOrchestrator, AcquisitionReport, PairKey,
    PairOutcome, PairPhase, PairResult,
};
pub use parser::{encode_canonical, BarParser, ColumnMapping, ColumnNames, ParseOptions, ParseOutcome};
pub use progress::{AcquisitionEvents, TracingEvents};
pub use provider::{DataError, FetchContext, FetchRequest, FetchWindow, SourceAdapter, SourceRouter};
pub use slugs::{SlugDirectory, SlugPolicy};
pub use table::RawTable;
pub use yahoo::EquityAdapter;
