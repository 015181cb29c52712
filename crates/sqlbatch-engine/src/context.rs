//! Run context
//!
//! Everything a stage needs to know about the current run. The context is
//! built once, before the first stage, and only its cancellation token changes
//! afterwards.

use crate::config::JobConfig;
use crate::error::{EngineError, Result};
use crate::params::ParameterSpec;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Execution mode of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Render and preview queries; touch no store
    #[default]
    Plan,
    /// Execute every unit whose output is missing (or all, with overwrite)
    Run,
    /// Re-execute what the previous run did not complete
    Retry,
}

impl FromStr for RunMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "plan" | "dryrun" | "dry-run" => Ok(RunMode::Plan),
            "run" | "normal" | "all" | "execute" => Ok(RunMode::Run),
            "retry" | "failed" | "fail" | "replay" => Ok(RunMode::Retry),
            other => Err(EngineError::config(format!(
                "unknown mode '{other}' (expected plan, run or retry)"
            ))),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Plan => "plan",
            RunMode::Run => "run",
            RunMode::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// Caller-supplied settings for one run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub workdir: PathBuf,
    pub mode: RunMode,
    /// `k=v` overrides applied on top of the job's parameters
    pub param_overrides: Vec<(String, String)>,
    /// Source host name recorded in the ledger
    pub host: String,
    /// `k=v` pairs every loaded partition suffix must contain
    pub load_filter: Vec<(String, String)>,
}

/// Metadata written to `run_info.json` in the run directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub job_name: String,
    pub run_id: String,
    pub started_at: DateTime<Local>,
    pub mode: RunMode,
    pub params: ParameterSpec,
    pub host: String,
}

/// Immutable description of the current run
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub job: JobConfig,
    pub run_id: String,
    pub mode: RunMode,
    /// Job parameters overlaid with overrides
    pub params: ParameterSpec,
    pub host: String,
    pub load_filter: Vec<(String, String)>,
    pub workdir: PathBuf,
    pub log_dir: PathBuf,
    pub run_dir: PathBuf,
    pub started_at: DateTime<Local>,
    cancel: CancellationToken,
}

impl PipelineContext {
    /// Resolve paths and parameters, claim a run id and record it
    pub fn create(mut job: JobConfig, options: RunOptions, cancel: CancellationToken) -> Result<Self> {
        job.validate()?;
        job.resolve_paths(&options.workdir);

        let mut params = job.params.clone();
        for (key, value) in &options.param_overrides {
            if let Some(previous) = params.insert(key.clone(), value.clone()) {
                info!(param = %key, from = %previous, to = %value, "parameter overridden");
            }
        }

        let job_dir = job.job_out_dir();
        let (run_id, run_dir) = allocate_run_dir(&job_dir, &job.job_name)?;
        let started_at = Local::now();

        let ctx = Self {
            run_id,
            mode: options.mode,
            params,
            host: options.host,
            load_filter: options.load_filter,
            log_dir: options.workdir.join("logs"),
            workdir: options.workdir,
            run_dir,
            started_at,
            job,
            cancel,
        };
        ctx.write_run_info()?;

        Ok(ctx)
    }

    pub fn job_name(&self) -> &str {
        &self.job.job_name
    }

    /// Directory holding this job's partition files
    pub fn export_dir(&self) -> PathBuf {
        self.job.job_out_dir()
    }

    /// Directory holding this job's run ledgers
    pub fn ledger_dir(&self) -> PathBuf {
        ledger_dir(&self.log_dir, self.job_name())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_info(&self) -> RunInfo {
        RunInfo {
            job_name: self.job.job_name.clone(),
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            mode: self.mode,
            params: self.params.clone(),
            host: self.host.clone(),
        }
    }

    fn write_run_info(&self) -> Result<()> {
        let path = self.run_dir.join("run_info.json");
        std::fs::write(&path, serde_json::to_string_pretty(&self.run_info())?)?;
        Ok(())
    }
}

/// Ledger directory of a job under a log directory
pub fn ledger_dir(log_dir: &Path, job_name: &str) -> PathBuf {
    log_dir.join("run_history").join(job_name)
}

/// Claim the next `<job>_<NN>` directory under `job_dir`
///
/// Creation is the claim: if another process takes the same number first the
/// next one is tried.
fn allocate_run_dir(job_dir: &Path, job_name: &str) -> Result<(String, PathBuf)> {
    std::fs::create_dir_all(job_dir)?;

    let prefix = format!("{job_name}_");
    let mut highest = 0u32;
    for entry in std::fs::read_dir(job_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(n) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|n| n.parse::<u32>().ok())
        {
            highest = highest.max(n);
        }
    }

    for n in highest + 1..highest + 100 {
        let run_id = format!("{job_name}_{n:02}");
        let run_dir = job_dir.join(&run_id);
        match std::fs::create_dir(&run_dir) {
            Ok(()) => return Ok((run_id, run_dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(run_id = %run_id, "run id taken concurrently; trying next");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(EngineError::config(format!(
        "could not allocate a run directory under '{}'",
        job_dir.display()
    )))
}
