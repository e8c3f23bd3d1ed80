//! Local CSV cache of raw provider payloads.
//!
//! Layout: `{root}/{SYMBOL}-{year}-{source}.csv` for daily runs and
//! `{root}/weekly/{SYMBOL}-{year}-{source}.csv` for weekly runs. Both hold
//! daily rows; a weekly entry covers the weekly window, which does not line
//! up with the calendar year.
//!
//! - A file's existence is the hit signal; content is not validated here.
//! - Entries never expire and are only overwritten under force-download.
//! - Writes are atomic (write to `.tmp`, fsync, rename into place), so an
//!   interrupted write never leaves a file that looks like a valid hit.

use super::provider::DataError;
use crate::domain::{DataSource, Frequency, Instrument};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const CACHE_EXTENSION: &str = "csv";
const WEEKLY_DIR: &str = "weekly";

/// The raw-payload cache rooted at one storage directory.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if needed. Returns true if it was created.
    pub fn ensure_root(&self) -> Result<bool, DataError> {
        if self.root.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(&self.root).map_err(|e| DataError::CacheWriteFailure {
            path: self.root.clone(),
            reason: format!("failed to create storage directory: {e}"),
        })?;
        Ok(true)
    }

    /// Deterministic path for an (instrument, year, source) entry of a
    /// daily or weekly run.
    pub fn path(
        &self,
        instrument: &Instrument,
        year: i32,
        source: DataSource,
        frequency: Frequency,
    ) -> PathBuf {
        let name = format!("{}-{year}-{source}.{CACHE_EXTENSION}", instrument.file_stem());
        match frequency {
            Frequency::Day => self.root.join(name),
            Frequency::Week => self.root.join(WEEKLY_DIR).join(name),
        }
    }

    /// Hit test: pure file existence.
    pub fn has(&self, path: &Path) -> bool {
        path.is_file()
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, DataError> {
        fs::read(path).map_err(|e| DataError::CacheReadFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Atomically write `bytes` to `path`.
    ///
    /// The weekly subdirectory is created on demand; the root must exist.
    pub fn store(&self, path: &Path, bytes: &[u8]) -> Result<(), DataError> {
        let weekly = self.root.join(WEEKLY_DIR);
        if path.parent() == Some(weekly.as_path()) && self.root.is_dir() && !weekly.is_dir() {
            fs::create_dir(&weekly).map_err(|e| DataError::CacheWriteFailure {
                path: weekly.clone(),
                reason: format!("failed to create weekly directory: {e}"),
            })?;
        }
        write_atomic(path, bytes)
    }

    /// All cache entries under the root, sorted by path (daily entries
    /// first, then weekly ones).
    pub fn entries(&self) -> Result<Vec<CacheEntry>, DataError> {
        let mut entries = self.entries_in(&self.root, Frequency::Day)?;
        let weekly = self.root.join(WEEKLY_DIR);
        if weekly.is_dir() {
            entries.extend(self.entries_in(&weekly, Frequency::Week)?);
        }
        Ok(entries)
    }

    fn entries_in(&self, dir: &Path, frequency: Frequency) -> Result<Vec<CacheEntry>, DataError> {
        let read_err = |e: std::io::Error| DataError::CacheReadFailure {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        };
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CACHE_EXTENSION) {
                continue;
            }
            let Some(parsed) = parse_file_name(&path) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(CacheEntry {
                path,
                stem: parsed.0,
                year: parsed.1,
                source: parsed.2,
                frequency,
                size,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

/// A file found in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub stem: String,
    pub year: i32,
    pub source: DataSource,
    pub frequency: Frequency,
    pub size: u64,
}

/// Split `{stem}-{year}-{source}.csv`; stems may themselves contain dashes.
fn parse_file_name(path: &Path) -> Option<(String, i32, DataSource)> {
    let name = path.file_stem()?.to_str()?;
    let (rest, source) = name.rsplit_once('-')?;
    let (stem, year) = rest.rsplit_once('-')?;
    let source = match source {
        "equity" => DataSource::Equity,
        "crypto" => DataSource::Crypto,
        _ => return None,
    };
    Some((stem.to_string(), year.parse().ok()?, source))
}

/// Write to `{path}.tmp`, sync, then rename into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DataError> {
    let write_err = |reason: String| DataError::CacheWriteFailure {
        path: path.to_path_buf(),
        reason,
    };
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(write_err(format!("temp write failed: {e}")));
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        write_err(format!("atomic rename failed: {e}"))
    })
}
