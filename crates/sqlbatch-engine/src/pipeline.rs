//! Pipeline orchestration
//!
//! Stages run strictly in configured order on the calling task. The stage list
//! is parsed up front, so an unknown name fails the run before anything
//! executes. Cancellation is checked before every stage; a cancelled run ends
//! as [`RunStatus::Stopped`] rather than as an error.

use crate::context::PipelineContext;
use crate::error::{EngineError, Result};
use crate::export::{run_export, ExportSummary};
use crate::ledger::RunLedger;
use crate::load::{run_load, LoadSummary};
use crate::postwork::{run_postwork, PostworkSummary};
use crate::report::{run_report, ReportSummary};
use crate::source::Connector;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Process exit code of a run that completed with failures
pub const EXIT_PARTIAL: i32 = 2;

/// Process exit code of a run stopped by a signal
pub const EXIT_STOPPED: i32 = 130;

/// A pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Export,
    Load,
    Postwork,
    Report,
}

impl FromStr for Stage {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "export" => Ok(Stage::Export),
            "load" | "load_local" => Ok(Stage::Load),
            "postwork" => Ok(Stage::Postwork),
            "report" => Ok(Stage::Report),
            _ => Err(EngineError::UnknownStage(s.to_string())),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Export => write!(f, "export"),
            Stage::Load => write!(f, "load"),
            Stage::Postwork => write!(f, "postwork"),
            Stage::Report => write!(f, "report"),
        }
    }
}

/// Parse every configured stage name, failing on the first unknown one
pub fn parse_stages<S: AsRef<str>>(names: &[S]) -> Result<Vec<Stage>> {
    names.iter().map(|n| n.as_ref().parse()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Finished,
    Stopped,
}

/// What a pipeline run did
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub stages: Vec<Stage>,
    pub export: Option<ExportSummary>,
    pub load: Option<LoadSummary>,
    pub postwork: Option<PostworkSummary>,
    pub report: Option<ReportSummary>,
    pub ledger_path: PathBuf,
}

impl RunReport {
    /// Failures that did not abort the run
    pub fn failures(&self) -> usize {
        self.export.map_or(0, |e| e.failed) + self.load.map_or(0, |l| l.failed)
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Stopped => EXIT_STOPPED,
            RunStatus::Finished if self.failures() > 0 => EXIT_PARTIAL,
            RunStatus::Finished => 0,
        }
    }
}

/// Run the job's configured stages
pub async fn run_pipeline(ctx: &PipelineContext, connector: Arc<dyn Connector>) -> Result<RunReport> {
    let stages = parse_stages(&ctx.job.pipeline.stages)?;
    let ledger = Arc::new(RunLedger::open(ctx.ledger_dir(), &ctx.run_id)?);
    if stages.is_empty() {
        warn!("no stages defined in pipeline");
    }

    info!(
        job = ctx.job_name(),
        run_id = %ctx.run_id,
        mode = %ctx.mode,
        host = %ctx.host,
        stages = ?stages,
        "pipeline starting"
    );

    let mut report = RunReport {
        run_id: ctx.run_id.clone(),
        status: RunStatus::Finished,
        stages: stages.clone(),
        export: None,
        load: None,
        postwork: None,
        report: None,
        ledger_path: ledger.path().to_path_buf(),
    };

    let total = stages.len();
    for (idx, stage) in stages.into_iter().enumerate() {
        if ctx.is_cancelled() {
            warn!(stage = %stage, "run stopped before stage");
            report.status = RunStatus::Stopped;
            break;
        }

        let started = Instant::now();
        info!("[{}/{}] {}", idx + 1, total, stage);
        match stage {
            Stage::Export => {
                let summary = run_export(ctx, Arc::clone(&connector), Arc::clone(&ledger)).await?;
                report.export = Some(summary);
            }
            Stage::Load => report.load = Some(run_load(ctx)?),
            Stage::Postwork => report.postwork = Some(run_postwork(ctx)?),
            Stage::Report => report.report = Some(run_report(ctx, &ledger)?),
        }
        info!(
            stage = %stage,
            elapsed_sec = started.elapsed().as_secs_f64(),
            "stage done"
        );
    }

    // a signal during the last stage still stops the run
    if ctx.is_cancelled() {
        report.status = RunStatus::Stopped;
    }

    info!(
        run_id = %report.run_id,
        status = ?report.status,
        failures = report.failures(),
        "pipeline finished"
    );

    Ok(report)
}
