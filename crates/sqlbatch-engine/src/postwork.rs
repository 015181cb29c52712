//! Postwork stage
//!
//! Runs every `*.sql` file under the postwork directory (recursively, in path
//! order) against the local store once loading is done. The job's schema is
//! attached first, so scripts can address partition tables and union views
//! as `<schema>.<table>`.
//!
//! A failing script stops the stage; scripts after it do not run.

use crate::context::{PipelineContext, RunMode};
use crate::error::{EngineError, Result};
use crate::store::LocalStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Counts reported by the postwork stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PostworkSummary {
    pub executed: usize,
}

/// Run the postwork stage for the current job
pub fn run_postwork(ctx: &PipelineContext) -> Result<PostworkSummary> {
    if ctx.mode == RunMode::Plan {
        info!("plan mode: postwork stage skipped");
        return Ok(PostworkSummary::default());
    }

    let sql_dir = &ctx.job.postwork.sql_dir;
    if !sql_dir.is_dir() {
        info!(dir = %sql_dir.display(), "postwork directory not found; skip");
        return Ok(PostworkSummary::default());
    }

    let scripts = postwork_scripts(sql_dir);
    if scripts.is_empty() {
        info!(dir = %sql_dir.display(), "no postwork SQL files");
        return Ok(PostworkSummary::default());
    }

    let store = LocalStore::open(&ctx.job.target.db_path)?;
    store.ensure_schema(ctx.job.schema())?;

    run_scripts(&store, &scripts, &ctx.cancel_token())
}

/// `*.sql` files below `dir`, sorted by path
pub fn postwork_scripts(dir: &Path) -> Vec<PathBuf> {
    let mut scripts: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
        })
        .collect();
    scripts.sort();
    scripts
}

/// Execute `scripts` in order, stopping early when `cancel` fires
pub fn run_scripts(
    store: &LocalStore,
    scripts: &[PathBuf],
    cancel: &CancellationToken,
) -> Result<PostworkSummary> {
    let total = scripts.len();
    let mut summary = PostworkSummary::default();

    for (idx, path) in scripts.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!(remaining = total - idx, "postwork stopped");
            break;
        }

        let file = path.display().to_string();
        let text = std::fs::read_to_string(path)?;
        let hash = sqlbatch_common::hash::hash_text(&text);
        let started = Instant::now();
        info!(file = %file, hash = %hash, "[{}/{}] postwork script starting", idx + 1, total);

        store
            .execute_batch(&text)
            .map_err(|e| EngineError::Postwork {
                file: file.clone(),
                message: e.to_string(),
            })?;

        info!(
            file = %file,
            hash = %hash,
            elapsed_sec = started.elapsed().as_secs_f64(),
            "[{}/{}] postwork script done",
            idx + 1,
            total
        );
        summary.executed += 1;
    }

    Ok(summary)
}
