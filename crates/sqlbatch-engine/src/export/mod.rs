//! Export stage
//!
//! Turns every (query file x parameter case) into a partition file:
//!
//! ```text
//! sql_dir/*.sql --discover--> QueryFile --expand--> ExportUnit --dispatch--> workers
//!                                                       |                       |
//!                                                 skip decision       partition file + ledger row
//! ```
//!
//! Skips are decided before dispatch, so a queued unit is always one that must
//! run. Expansion failures are recorded per query and never stop sibling
//! queries; a unit that fails every attempt halts the stage.

pub mod backup;
mod plan;
mod worker;

pub use plan::preview;

use crate::context::{PipelineContext, RunMode};
use crate::error::{EngineError, Result};
use crate::ledger::{truncate_error, LedgerKey, RunHistoryRecord, RunLedger, UnitStatus};
use crate::params::{self, ParameterCase, ParameterSpec};
use crate::partition::{PartitionFormat, PartitionKey, SUFFIX_SEPARATOR};
use crate::source::Connector;
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use worker::{ExportWorker, WorkerSettings};

/// One query file found in the SQL directory
#[derive(Debug, Clone)]
pub struct QueryFile {
    /// File stem; upper-cased, it is the logical table name
    pub name: String,
    pub file_name: String,
    pub path: PathBuf,
    pub text: String,
    /// SHA-256 of the file content
    pub hash: String,
}

impl QueryFile {
    pub fn load(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::config(format!("bad query file name: {}", path.display())))?
            .to_string();
        let name = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or(&file_name)
            .to_string();
        let text = std::fs::read_to_string(path)?;
        let hash = sqlbatch_common::hash::hash_text(&text);

        Ok(Self {
            name,
            file_name,
            path: path.to_path_buf(),
            text,
            hash,
        })
    }

    pub fn table(&self) -> String {
        self.name.to_uppercase()
    }
}

/// One executable (query, parameter case) pair
#[derive(Debug, Clone)]
pub struct ExportUnit {
    pub sql_file: String,
    pub sql_hash: String,
    pub case: ParameterCase,
    pub key: PartitionKey,
    /// Rendered text with the terminator removed
    pub sql: String,
    pub output_path: PathBuf,
}

impl ExportUnit {
    pub fn ledger_key(&self, host: &str) -> LedgerKey {
        LedgerKey {
            host: host.to_string(),
            sql_file: self.sql_file.clone(),
            params: self.case.description(),
            sql_hash: self.sql_hash.clone(),
        }
    }

    /// Short label for logs: `file [k=v,...]`
    pub fn label(&self) -> String {
        format!("{} [{}]", self.sql_file, self.case)
    }
}

/// Counts reported by the export stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows: u64,
}

impl ExportSummary {
    fn absorb(&mut self, other: ExportSummary) {
        self.executed += other.executed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.rows += other.rows;
    }
}

/// Query files of `sql_dir` in execution order
///
/// When any file carries a numeric prefix (`01_sales.sql`) files are ordered
/// by that number, unprefixed files last; otherwise by case-insensitive name.
pub fn discover_queries(sql_dir: &Path) -> Result<Vec<QueryFile>> {
    if !sql_dir.is_dir() {
        return Err(EngineError::config(format!(
            "SQL directory not found: {}",
            sql_dir.display()
        )));
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(sql_dir)? {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
        {
            paths.push(path);
        }
    }

    order_sql_files(&mut paths)?;
    paths.iter().map(|p| QueryFile::load(p)).collect()
}

fn order_sql_files(paths: &mut [PathBuf]) -> Result<()> {
    let prefix = Regex::new(r"(?i)^(\d+)_.*\.sql$")?;
    let name_of = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let order_of = |p: &PathBuf| {
        prefix
            .captures(&name_of(p))
            .and_then(|c| c[1].parse::<u64>().ok())
    };

    if paths.iter().any(|p| order_of(p).is_some()) {
        paths.sort_by_key(|p| {
            let order = order_of(p);
            (order.is_none(), order, name_of(p))
        });
    } else {
        paths.sort_by_key(|p| name_of(p).to_lowercase());
    }

    Ok(())
}

/// Every unit of one query, in case order
pub fn build_units(
    query: &QueryFile,
    params: &ParameterSpec,
    out_dir: &Path,
    format: PartitionFormat,
) -> Result<Vec<ExportUnit>> {
    // a trailing '_' would merge into the separator when the key is decoded
    if query.name.contains(SUFFIX_SEPARATOR) || query.name.ends_with('_') {
        return Err(EngineError::config(format!(
            "query name '{}' must not contain '{SUFFIX_SEPARATOR}' or end with '_'",
            query.name
        )));
    }

    let units: Vec<ExportUnit> = params::build_cases(&query.name, &query.text, params)?
        .into_iter()
        .map(|case| {
            let sql = params::strip_terminator(&params::render(&query.text, &case)?);
            let key = PartitionKey::for_case(&query.name, &case);
            let output_path = key.output_path(out_dir, format);
            Ok(ExportUnit {
                sql_file: query.file_name.clone(),
                sql_hash: query.hash.clone(),
                case,
                key,
                sql,
                output_path,
            })
        })
        .collect::<Result<_>>()?;

    // SQLite table names ignore case, so these would land in one table
    let mut seen = HashSet::new();
    for unit in &units {
        let name = unit.key.physical_name();
        if !seen.insert(name.to_lowercase()) {
            return Err(EngineError::config(format!(
                "partition '{name}' of '{}' differs from another only by case",
                query.name
            )));
        }
    }

    Ok(units)
}

/// Why a unit did not need to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    CompletedPreviously,
    OutputExists,
}

fn skip_reason(
    unit: &ExportUnit,
    mode: RunMode,
    overwrite: bool,
    host: &str,
    succeeded: &HashSet<LedgerKey>,
) -> Option<SkipReason> {
    let exists = unit.output_path.exists();
    match mode {
        RunMode::Retry => (exists && succeeded.contains(&unit.ledger_key(host)))
            .then_some(SkipReason::CompletedPreviously),
        RunMode::Run => (exists && !overwrite).then_some(SkipReason::OutputExists),
        RunMode::Plan => None,
    }
}

/// Run the export stage
///
/// Plan mode renders queries into the plan file and touches neither the source
/// nor the ledger.
pub async fn run_export(
    ctx: &PipelineContext,
    connector: Arc<dyn Connector>,
    ledger: Arc<RunLedger>,
) -> Result<ExportSummary> {
    let export = &ctx.job.export;
    let queries = discover_queries(&export.sql_dir)?;
    if queries.is_empty() {
        warn!(sql_dir = %export.sql_dir.display(), "no SQL files found");
        return Ok(ExportSummary::default());
    }

    let out_dir = ctx.export_dir();
    let format = export.partition_format();

    if ctx.mode == RunMode::Plan {
        return plan::write_plan(ctx, &queries, &out_dir, format);
    }

    std::fs::create_dir_all(&out_dir)?;
    let host = connector.host().to_string();
    let succeeded = ledger.load_success_keys(ctx.mode);

    info!(
        queries = queries.len(),
        workers = export.workers,
        mode = %ctx.mode,
        host = %host,
        out_dir = %out_dir.display(),
        "export starting"
    );

    let halt = ctx.cancel_token().child_token();
    let settings = WorkerSettings {
        format,
        fetch_size: export.fetch_size,
        stall: Duration::from_secs(export.stall_seconds),
        backup_keep: export.backup_keep,
    };

    let (tx, rx) = mpsc::channel::<ExportUnit>(export.workers * 2);
    let rx = Arc::new(Mutex::new(rx));
    let handles: Vec<_> = (0..export.workers)
        .map(|id| {
            let worker = ExportWorker::new(
                id,
                Arc::clone(&connector),
                Arc::clone(&ledger),
                settings.clone(),
                halt.clone(),
            );
            tokio::spawn(worker.run(Arc::clone(&rx)))
        })
        .collect();
    drop(rx);

    let mut summary = ExportSummary::default();
    'queries: for (idx, query) in queries.iter().enumerate() {
        if halt.is_cancelled() {
            warn!("export dispatch stopped");
            break;
        }

        info!("[{}/{}] {}", idx + 1, queries.len(), query.file_name);

        let units = match build_units(query, &ctx.params, &out_dir, format) {
            Ok(units) => units,
            Err(e) => {
                error!(sql_file = %query.file_name, error = %e, "parameter expansion failed");
                ledger.append(&expansion_failure(query, &host, &e))?;
                summary.failed += 1;
                continue;
            }
        };

        for unit in units {
            if halt.is_cancelled() {
                warn!("export dispatch stopped");
                break 'queries;
            }

            if let Some(reason) = skip_reason(&unit, ctx.mode, export.overwrite, &host, &succeeded) {
                info!(unit = %unit.label(), ?reason, "skip");
                summary.skipped += 1;
                continue;
            }

            if tx.send(unit).await.is_err() {
                // every worker has exited
                break 'queries;
            }
        }
    }
    drop(tx);

    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(outcome) => {
                summary.absorb(outcome.summary);
                if let Some(e) = outcome.error {
                    first_error.get_or_insert(e);
                }
            }
            Err(join) => {
                first_error.get_or_insert(EngineError::source(format!("export worker panicked: {join}")));
            }
        }
    }

    info!(
        executed = summary.executed,
        skipped = summary.skipped,
        failed = summary.failed,
        rows = summary.rows,
        "export finished"
    );

    match first_error {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

fn expansion_failure(query: &QueryFile, host: &str, err: &EngineError) -> RunHistoryRecord {
    RunHistoryRecord {
        run_ts: Utc::now(),
        host: host.to_string(),
        sql_file: query.file_name.clone(),
        params: "-".to_string(),
        sql_hash: query.hash.clone(),
        status: UnitStatus::Fail,
        rows: 0,
        elapsed_sec: 0.0,
        output_file: String::new(),
        error_message: truncate_error(&err.to_string()),
    }
}
