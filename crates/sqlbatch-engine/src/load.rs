//! Load stage
//!
//! Merges partition files from the job's export directory into the local
//! store. Each partition becomes its own physical table (`SALES__m=202401`);
//! a logical table with suffixed partitions is then exposed as a view
//! (`SALES`) over all of them.
//!
//! A file that fails to load is logged and counted; the remaining files are
//! still loaded.

use crate::codec::PartitionReader;
use crate::config::DedupMode;
use crate::context::{PipelineContext, RunMode};
use crate::error::Result;
use crate::export::discover_queries;
use crate::partition::{decode_file_name, PartitionFormat, PartitionKey, SUFFIX_SEPARATOR};
use crate::store::{LoadHistoryRecord, LocalStore};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Counts reported by the load stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub loaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub views: usize,
}

/// Everything one load pass needs
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    pub job_name: &'a str,
    pub schema: &'a str,
    pub export_dir: &'a Path,
    pub format: PartitionFormat,
    /// Logical tables this job owns
    pub targets: &'a BTreeSet<String>,
    /// `k=v` pairs a partition suffix must contain
    pub filter: &'a [(String, String)],
    pub dedup: DedupMode,
}

/// Run the load stage for the current job
pub fn run_load(ctx: &PipelineContext) -> Result<LoadSummary> {
    if ctx.mode == RunMode::Plan {
        info!("plan mode: load stage skipped");
        return Ok(LoadSummary::default());
    }

    let export_dir = ctx.export_dir();
    if !export_dir.is_dir() {
        warn!(dir = %export_dir.display(), "export directory missing; nothing to load");
        return Ok(LoadSummary::default());
    }

    let targets: BTreeSet<String> = discover_queries(&ctx.job.export.sql_dir)?
        .iter()
        .map(|q| q.table())
        .collect();

    let mut store = LocalStore::open(&ctx.job.target.db_path)?;
    let request = LoadRequest {
        job_name: ctx.job_name(),
        schema: ctx.job.schema(),
        export_dir: &export_dir,
        format: ctx.job.export.partition_format(),
        targets: &targets,
        filter: &ctx.load_filter,
        dedup: ctx.job.target.dedup,
    };

    load_partitions(&mut store, &request)
}

/// Load every eligible partition file, then rebuild union views
pub fn load_partitions(store: &mut LocalStore, request: &LoadRequest<'_>) -> Result<LoadSummary> {
    store.ensure_schema(request.schema)?;

    let mut summary = LoadSummary::default();
    let files = partition_files(request.export_dir)?;

    info!(
        schema = request.schema,
        files = files.len(),
        targets = request.targets.len(),
        dedup = ?request.dedup,
        "load starting"
    );

    for (file_name, path) in files {
        let Some(key) = decode_file_name(&file_name, request.format) else {
            continue;
        };
        if !request.targets.contains(&key.table) {
            debug!(file = %file_name, "not a target table; ignored");
            continue;
        }
        if !key.matches_filter(request.filter.iter().map(|(k, v)| (k.as_str(), v.as_str()))) {
            debug!(file = %file_name, "filtered out");
            continue;
        }

        match load_file(store, request, &key, &path) {
            Ok(Some(rows)) => {
                info!(table = %key.physical_name(), rows, "partition loaded");
                summary.loaded += 1;
            }
            Ok(None) => {
                info!(file = %file_name, "already loaded; skip");
                summary.skipped += 1;
            }
            Err(e) => {
                error!(file = %file_name, error = %e, "partition load failed");
                summary.failed += 1;
            }
        }
    }

    for table in request.targets {
        match build_union_view(store, request.schema, table) {
            Ok(true) => summary.views += 1,
            Ok(false) => {}
            Err(e) => {
                error!(table = %table, error = %e, "union view failed");
                summary.failed += 1;
            }
        }
    }

    info!(
        loaded = summary.loaded,
        skipped = summary.skipped,
        failed = summary.failed,
        views = summary.views,
        "load finished"
    );

    Ok(summary)
}

/// Partition candidates in the export directory, sorted by name
fn partition_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    files.sort();
    Ok(files)
}

/// Load one file; `None` when the load history says it is already in
fn load_file(
    store: &mut LocalStore,
    request: &LoadRequest<'_>,
    key: &PartitionKey,
    path: &Path,
) -> Result<Option<u64>> {
    let file_hash = sqlbatch_common::hash::hash_file(path)?;

    if store.is_loaded(request.dedup, request.schema, &key.table, &key.suffix, &file_hash)? {
        return Ok(None);
    }

    let history = LoadHistoryRecord {
        job_name: request.job_name.to_string(),
        schema_name: request.schema.to_string(),
        table_name: key.table.clone(),
        file_suffix: key.suffix.clone(),
        file_hash,
        loaded_at: Utc::now(),
    };

    let mut reader = PartitionReader::open(path)?;
    // under hash dedup a changed file supersedes the rows of its earlier version
    let replace = request.dedup == DedupMode::Hash;
    let rows = store.load_partition(
        request.schema,
        &key.physical_name(),
        &mut reader,
        replace,
        &history,
    )?;

    Ok(Some(rows))
}

/// Point view `table` at its suffixed partitions; `false` when no view applies
fn build_union_view(store: &LocalStore, schema: &str, table: &str) -> Result<bool> {
    let partitions: Vec<String> = store
        .list_tables(schema)?
        .into_iter()
        .filter(|name| {
            name.strip_prefix(table)
                .is_some_and(|rest| rest.starts_with(SUFFIX_SEPARATOR))
        })
        .collect();

    if partitions.is_empty() {
        return Ok(false);
    }

    if store.table_exists(schema, table)? {
        warn!(
            table,
            "a base table has the logical name; union view not created"
        );
        return Ok(false);
    }

    store.replace_union_view(schema, table, &partitions)?;
    info!(view = table, partitions = partitions.len(), "union view replaced");
    Ok(true)
}
