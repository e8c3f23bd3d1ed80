//! barfeed CLI: download, slug and cache management commands.
//!
//! Commands:
//! - `download`: acquire yearly bar files for instruments into local storage
//!   and assemble them into a feed, optionally exporting canonical CSV
//! - `slugs`: show or refresh the crypto symbol → slug directory
//! - `cache status`: list cached (instrument, year, source) files

use anyhow::{anyhow, bail, Context, Result};
use barfeed_core::data::coinmarketcap::DEFAULT_CRYPTO_BASE;
use barfeed_core::data::{
    build_feed, encode_canonical, Acquisition, CancelToken, FetchContext, HttpFetcher,
    LocalCache, PairOutcome, RetryPolicy, SlugDirectory, SlugPolicy, TracingEvents,
};
use barfeed_core::domain::{Exchange, Frequency, Instrument};
use barfeed_core::AcquisitionConfig;
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "barfeed",
    version,
    about = "barfeed: cached historical bar downloads for equities and crypto"
)]
struct Cli {
    /// Debug-level logging (overrides RUST_LOG).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download (or load from cache) yearly bar files and assemble a feed.
    Download(DownloadArgs),
    /// Show or refresh the crypto symbol → URL slug directory.
    Slugs {
        /// Symbols to resolve. Lists the whole table when empty.
        symbols: Vec<String>,

        /// Scrape the listing page even if the side file is fresh.
        #[arg(long, default_value_t = false)]
        refresh: bool,

        /// Storage directory holding the side file. Defaults to ./data.
        #[arg(long, default_value = "data")]
        storage: PathBuf,

        /// Crypto provider base URL.
        #[arg(long)]
        crypto_base: Option<String>,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached files with their year, source and size.
    Status {
        /// Storage directory. Defaults to ./data.
        #[arg(long, default_value = "data")]
        storage: PathBuf,
    },
}

#[derive(Args)]
struct DownloadArgs {
    /// Exchange for every --table-code (e.g. CRYPTO, NYSEARCA).
    #[arg(long)]
    source_code: Option<String>,

    /// Symbol on --source-code; repeat for several.
    #[arg(long)]
    table_code: Vec<String>,

    /// Instrument as SYMBOL-EXCHANGE (e.g. BTC-CRYPTO); repeat for several.
    #[arg(long)]
    instrument: Vec<String>,

    /// The first year to download.
    #[arg(long)]
    from_year: Option<i32>,

    /// The last year to download.
    #[arg(long)]
    to_year: Option<i32>,

    /// Storage directory. Defaults to ./data.
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Re-download even if the files exist.
    #[arg(long, default_value_t = false)]
    force_download: bool,

    /// Keep going when a pair fails.
    #[arg(long, default_value_t = false)]
    ignore_errors: bool,

    /// daily or weekly.
    #[arg(long)]
    frequency: Option<String>,

    /// IANA timezone to localize every bar to (e.g. America/New_York).
    #[arg(long)]
    timezone: Option<String>,

    /// Drop malformed rows instead of failing the file.
    #[arg(long, default_value_t = false)]
    skip_malformed_bars: bool,

    /// Repair inconsistent high/low values instead of rejecting the row.
    #[arg(long, default_value_t = false)]
    sanitize: bool,

    /// TOML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write one canonical CSV per instrument into this directory.
    #[arg(long)]
    export: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Download(args) => run_download(args),
        Commands::Slugs {
            symbols,
            refresh,
            storage,
            crypto_base,
        } => run_slugs(&symbols, refresh, &storage, crypto_base),
        Commands::Cache { action } => match action {
            CacheAction::Status { storage } => run_cache_status(&storage),
        },
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_download(args: DownloadArgs) -> Result<()> {
    let export = args.export.clone();
    let config = build_config(args)?;
    info!(
        instruments = config.instruments.len(),
        from_year = config.from_year,
        to_year = config.to_year,
        storage = %config.storage.display(),
        frequency = %config.frequency,
        "starting acquisition"
    );

    let acquisition = build_feed(&config, Arc::new(TracingEvents))
        .context("acquisition aborted")?;
    print_summary(&acquisition);

    if let Some(dir) = export {
        export_feed(&acquisition, &dir)?;
    }
    Ok(())
}

/// Config file (if any) overlaid with command-line flags.
fn build_config(args: DownloadArgs) -> Result<AcquisitionConfig> {
    let mut instruments = Vec::new();
    if !args.table_code.is_empty() {
        let Some(source_code) = &args.source_code else {
            bail!("--table-code requires --source-code");
        };
        let exchange: Exchange = source_code.parse()?;
        for code in &args.table_code {
            instruments.push(Instrument::new(code.trim(), exchange.clone()));
        }
    }
    for text in &args.instrument {
        instruments.push(
            text.parse::<Instrument>()
                .with_context(|| format!("bad --instrument '{text}'"))?,
        );
    }

    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let (Some(from), Some(to)) = (args.from_year, args.to_year) else {
                bail!("--from-year and --to-year are required without --config");
            };
            AcquisitionConfig::new(
                Vec::new(),
                from,
                to,
                args.storage.clone().unwrap_or_else(|| PathBuf::from("data")),
            )
        }
    };

    if !instruments.is_empty() {
        config.instruments = instruments;
    }
    if let Some(year) = args.from_year {
        config.from_year = year;
    }
    if let Some(year) = args.to_year {
        config.to_year = year;
    }
    if let Some(storage) = args.storage {
        config.storage = storage;
    }
    if let Some(freq) = &args.frequency {
        config.frequency = freq.parse::<Frequency>().map_err(anyhow::Error::msg)?;
    }
    if let Some(tz) = &args.timezone {
        config.timezone = Some(
            tz.parse::<Tz>()
                .map_err(|e| anyhow!("unknown timezone '{tz}': {e}"))?,
        );
    }
    config.force_download |= args.force_download;
    config.skip_errors |= args.ignore_errors;
    config.skip_malformed_bars |= args.skip_malformed_bars;
    config.sanitize |= args.sanitize;

    config.validate()?;
    Ok(config)
}

fn print_summary(acquisition: &Acquisition) {
    let report = &acquisition.report;
    println!();
    println!("=== Acquisition ===");
    println!("Pairs appended: {}", report.appended());
    println!("Pairs skipped:  {}", report.skipped());
    println!("Downloads:      {}", report.downloads);
    println!("Cache hits:     {}", report.cache_hits);
    println!("Bars in feed:   {}", acquisition.feed.bar_count());
    println!("Fingerprint:    {}", acquisition.feed.fingerprint());
    println!();
    println!("{:<20} {:>6} {:<8} {:>6}  Notes", "Instrument", "Year", "Source", "Bars");
    println!("{}", "-".repeat(60));
    for result in &report.pairs {
        let pair = &result.pair;
        match &result.outcome {
            PairOutcome::Appended {
                from_cache,
                bars,
                skipped_rows,
                repaired_rows,
                ..
            } => {
                let mut notes = vec![if *from_cache { "cached" } else { "downloaded" }.to_string()];
                if *skipped_rows > 0 {
                    notes.push(format!("{skipped_rows} rows skipped"));
                }
                if *repaired_rows > 0 {
                    notes.push(format!("{repaired_rows} rows repaired"));
                }
                println!(
                    "{:<20} {:>6} {:<8} {:>6}  {}",
                    pair.instrument.to_string(),
                    pair.year,
                    pair.source.as_str(),
                    bars,
                    notes.join(", ")
                );
            }
            PairOutcome::Skipped { error } => {
                eprintln!(
                    "{:<20} {:>6} {:<8} {:>6}  SKIPPED: {error}",
                    pair.instrument.to_string(),
                    pair.year,
                    pair.source.as_str(),
                    "-"
                );
            }
        }
    }
}

fn export_feed(acquisition: &Acquisition, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for (instrument, bars) in acquisition.feed.iter() {
        let path = dir.join(export_file_name(instrument));
        let bytes = encode_canonical(bars)?;
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        println!("Exported {} bars to {}", bars.len(), path.display());
    }
    Ok(())
}

fn export_file_name(instrument: &Instrument) -> String {
    format!("{}.csv", instrument.qualified_file_stem())
}

fn run_slugs(
    symbols: &[String],
    refresh: bool,
    storage: &Path,
    crypto_base: Option<String>,
) -> Result<()> {
    let cache = LocalCache::new(storage);
    cache.ensure_root()?;

    let base = crypto_base.unwrap_or_else(|| DEFAULT_CRYPTO_BASE.to_string());
    let policy = SlugPolicy {
        force_refresh: refresh,
        ..SlugPolicy::default()
    };
    let directory = SlugDirectory::new(&base, storage, policy);
    let fetcher = HttpFetcher::new(RetryPolicy::default())?;
    let cancel = CancelToken::new();
    let ctx = FetchContext {
        pair: None,
        events: &TracingEvents,
        cancel: &cancel,
    };

    if symbols.is_empty() {
        let count = directory.load(&fetcher, ctx)?;
        println!("{count} symbols known");
        for (symbol, slug) in directory.snapshot() {
            println!("{symbol:<10} {slug}");
        }
        return Ok(());
    }

    let mut missing = 0;
    for symbol in symbols {
        match directory.lookup(symbol, &fetcher, ctx) {
            Ok(slug) => println!("{:<10} {slug}", symbol.to_uppercase()),
            Err(e) => {
                eprintln!("{:<10} {e}", symbol.to_uppercase());
                missing += 1;
            }
        }
    }
    if missing > 0 {
        bail!("{missing} symbol(s) could not be resolved");
    }
    Ok(())
}

fn run_cache_status(storage: &Path) -> Result<()> {
    if !storage.exists() {
        println!("Storage directory does not exist: {}", storage.display());
        return Ok(());
    }

    let entries = LocalCache::new(storage).entries()?;
    if entries.is_empty() {
        println!("Cache is empty: {}", storage.display());
        return Ok(());
    }

    let total_size: u64 = entries.iter().map(|e| e.size).sum();
    println!("Cache: {}", storage.display());
    println!("Files: {}", entries.len());
    println!("Total size: {}", format_size(total_size));
    println!();
    println!(
        "{:<16} {:>6} {:<8} {:<7} {:>10}",
        "Symbol", "Year", "Source", "Run", "Size"
    );
    println!("{}", "-".repeat(52));
    for entry in &entries {
        println!(
            "{:<16} {:>6} {:<8} {:<7} {:>10}",
            entry.stem,
            entry.year,
            entry.source.as_str(),
            entry.frequency.to_string(),
            format_size(entry.size)
        );
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
