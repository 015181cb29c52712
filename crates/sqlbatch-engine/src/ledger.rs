//! Run ledger
//!
//! Append-only CSV audit log of every executed export unit, one file per run
//! (`<dir>/<run_id>.csv`). Retry mode reads the most recently modified prior
//! ledger and skips units it recorded as `OK`.
//!
//! The identity key embeds the SQL content hash, so editing a query voids
//! every earlier success claim for it.

use crate::context::RunMode;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Longest error message kept in a ledger row
pub const MAX_ERROR_LEN: usize = 500;

/// Outcome of one executed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAIL")]
    Fail,
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistoryRecord {
    pub run_ts: DateTime<Utc>,
    pub host: String,
    pub sql_file: String,
    pub params: String,
    pub sql_hash: String,
    pub status: UnitStatus,
    pub rows: u64,
    pub elapsed_sec: f64,
    pub output_file: String,
    pub error_message: String,
}

impl RunHistoryRecord {
    pub fn key(&self) -> LedgerKey {
        LedgerKey {
            host: self.host.clone(),
            sql_file: self.sql_file.clone(),
            params: self.params.clone(),
            sql_hash: self.sql_hash.clone(),
        }
    }
}

/// Identity of a unit across runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub host: String,
    pub sql_file: String,
    pub params: String,
    pub sql_hash: String,
}

/// Truncate an error message to [`MAX_ERROR_LEN`] characters
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}

/// The current run's ledger file
pub struct RunLedger {
    dir: PathBuf,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RunLedger {
    /// Bind a ledger to `<dir>/<run_id>.csv`; the file appears on first append
    pub fn open(dir: impl Into<PathBuf>, run_id: &str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{run_id}.csv"));

        debug!(path = %path.display(), "run ledger bound");

        Ok(Self {
            dir,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single flushed write
    ///
    /// The header is written when the file is new. Concurrent callers are
    /// serialised, so records never interleave.
    pub fn append(&self, record: &RunHistoryRecord) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| EngineError::ledger("ledger lock poisoned"))?;

        let needs_header = fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(Vec::new());
        writer.serialize(record)?;
        let bytes = writer
            .into_inner()
            .map_err(|e| EngineError::ledger(format!("Failed to encode record: {e}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&bytes)?;
        file.flush()?;

        Ok(())
    }

    /// Records written so far by this run
    pub fn records(&self) -> Result<Vec<RunHistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        read_records(&self.path)
    }

    /// Identity keys of units the previous run completed
    ///
    /// Empty unless retrying. An unreadable baseline degrades to "redo
    /// everything" instead of failing the run.
    pub fn load_success_keys(&self, mode: RunMode) -> HashSet<LedgerKey> {
        if mode != RunMode::Retry {
            return HashSet::new();
        }

        let baseline = match latest_ledger(&self.dir, Some(&self.path)) {
            Ok(Some(path)) => path,
            Ok(None) => {
                info!(dir = %self.dir.display(), "no prior run ledger; retry runs every unit");
                return HashSet::new();
            }
            Err(e) => {
                warn!(error = %e, "could not scan run ledgers; retry runs every unit");
                return HashSet::new();
            }
        };

        match read_records(&baseline) {
            Ok(records) => {
                let keys: HashSet<LedgerKey> = records
                    .iter()
                    .filter(|r| r.status == UnitStatus::Ok)
                    .map(RunHistoryRecord::key)
                    .collect();
                info!(
                    baseline = %baseline.display(),
                    succeeded = keys.len(),
                    "retry baseline loaded"
                );
                keys
            }
            Err(e) => {
                warn!(
                    baseline = %baseline.display(),
                    error = %e,
                    "unreadable run ledger; retry runs every unit"
                );
                HashSet::new()
            }
        }
    }
}

/// Most recently modified ledger in `dir`, skipping `exclude`
///
/// Ties on modification time fall back to the file name so run ids created
/// within the same clock tick still order deterministically.
pub fn latest_ledger(dir: &Path, exclude: Option<&Path>) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        if exclude.is_some_and(|ex| ex == path) {
            continue;
        }
        let modified = fs::metadata(&path)?.modified()?;
        candidates.push((modified, path));
    }

    Ok(candidates.into_iter().max().map(|(_, path)| path))
}

/// Parse every record of a ledger file
pub fn read_records(path: &Path) -> Result<Vec<RunHistoryRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    reader
        .deserialize()
        .map(|row| row.map_err(EngineError::from))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(sql_file: &str, params: &str, status: UnitStatus) -> RunHistoryRecord {
        RunHistoryRecord {
            run_ts: Utc::now(),
            host: "prod".to_string(),
            sql_file: sql_file.to_string(),
            params: params.to_string(),
            sql_hash: "abc".to_string(),
            status,
            rows: 3,
            elapsed_sec: 0.25,
            output_file: format!("/out/{sql_file}.csv"),
            error_message: String::new(),
        }
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let ledger = RunLedger::open(dir.path(), "job_01").unwrap();

        ledger.append(&record("a.sql", "-", UnitStatus::Ok)).unwrap();
        ledger
            .append(&record("b.sql", "m=202401", UnitStatus::Fail))
            .unwrap();

        let text = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text.matches("run_ts,host,sql_file").count(), 1);

        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, UnitStatus::Fail);
        assert_eq!(records[1].params, "m=202401");
    }

    #[test]
    fn test_success_keys_only_in_retry_mode() {
        let dir = TempDir::new().unwrap();
        let previous = RunLedger::open(dir.path(), "job_01").unwrap();
        previous.append(&record("a.sql", "-", UnitStatus::Ok)).unwrap();
        previous.append(&record("b.sql", "-", UnitStatus::Fail)).unwrap();

        let current = RunLedger::open(dir.path(), "job_02").unwrap();
        assert!(current.load_success_keys(RunMode::Run).is_empty());

        let keys = current.load_success_keys(RunMode::Retry);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&record("a.sql", "-", UnitStatus::Ok).key()));
    }

    #[test]
    fn test_corrupt_baseline_yields_empty_set() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("job_01.csv"), "run_ts,host\nnot-a-date\n").unwrap();

        let current = RunLedger::open(dir.path(), "job_02").unwrap();
        assert!(current.load_success_keys(RunMode::Retry).is_empty());
    }

    #[test]
    fn test_latest_ledger_excludes_current_run() {
        let dir = TempDir::new().unwrap();
        let first = RunLedger::open(dir.path(), "job_01").unwrap();
        first.append(&record("a.sql", "-", UnitStatus::Ok)).unwrap();
        let second = RunLedger::open(dir.path(), "job_02").unwrap();
        second.append(&record("a.sql", "-", UnitStatus::Ok)).unwrap();

        let latest = latest_ledger(dir.path(), Some(second.path())).unwrap();
        assert_eq!(latest.as_deref(), Some(first.path()));
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(RunLedger::open(dir.path(), "job_01").unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        ledger
                            .append(&record(&format!("q{i}.sql"), &format!("n={j}"), UnitStatus::Ok))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.records().unwrap().len(), 200);
    }

    #[test]
    fn test_truncate_error() {
        let long = "x".repeat(MAX_ERROR_LEN + 10);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }
}
