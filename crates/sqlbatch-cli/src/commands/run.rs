//! `sqlbatch run` command implementation
//!
//! Loads the job and environment files, claims a run id and drives the
//! pipeline. The returned value is the process exit code.

use crate::config;
use crate::error::Result;
use crate::RunArgs;
use colored::Colorize;
use sqlbatch_engine::context::{PipelineContext, RunMode, RunOptions};
use sqlbatch_engine::pipeline::{run_pipeline, RunReport, RunStatus};
use sqlbatch_engine::source::SqlxConnector;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Execute a pipeline run
pub async fn run(args: &RunArgs, cancel: CancellationToken) -> Result<i32> {
    let mode: RunMode = args.mode.parse()?;
    let workdir = args.workdir.clone();

    let job = config::load_job(&config::resolve(&workdir, &args.job))?;
    let env = config::load_env(&config::resolve(&workdir, &args.env))?;
    let param_overrides = config::parse_pairs(&args.params, "param")?;
    let load_filter = config::parse_pairs(&args.filters, "filter")?;
    let source = config::resolve_source(&env, args.host.as_deref(), &job, mode)?;

    let options = RunOptions {
        workdir,
        mode,
        param_overrides,
        host: source.name.clone(),
        load_filter,
    };
    let ctx = PipelineContext::create(job, options, cancel)?;

    println!(
        "{} {} {} ({} mode, host {})",
        "→".cyan(),
        "Run".bold(),
        ctx.run_id,
        ctx.mode,
        ctx.host
    );
    info!(run_id = %ctx.run_id, run_dir = %ctx.run_dir.display(), "run directory claimed");

    let connector = Arc::new(SqlxConnector::new(source.name, source.url));
    let report = run_pipeline(&ctx, connector).await?;

    print_report(&ctx, &report);
    Ok(report.exit_code())
}

fn print_report(ctx: &PipelineContext, report: &RunReport) {
    if let Some(export) = &report.export {
        println!(
            "  {} executed {}, skipped {}, failed {}, rows {}",
            "Export:".cyan(),
            export.executed,
            export.skipped,
            export.failed,
            export.rows
        );
    }
    if let Some(load) = &report.load {
        println!(
            "  {} loaded {}, skipped {}, failed {}, views {}",
            "Load:".cyan(),
            load.loaded,
            load.skipped,
            load.failed,
            load.views
        );
    }
    if let Some(postwork) = &report.postwork {
        println!("  {} executed {}", "Postwork:".cyan(), postwork.executed);
    }
    if let Some(path) = report.report.as_ref().and_then(|r| r.slow_sql_file.as_ref()) {
        println!("  {} {}", "Report:".cyan(), path.display());
    }
    if ctx.mode == RunMode::Plan {
        let plan = ctx.log_dir.join(format!("plan_{}.sql", ctx.run_id));
        println!("  {} {}", "Plan:".cyan(), plan.display());
    }

    match report.status {
        RunStatus::Stopped => println!("{} Run {} stopped", "✗".yellow(), report.run_id),
        RunStatus::Finished if report.failures() > 0 => println!(
            "{} Run {} finished with {} failure(s)",
            "!".yellow(),
            report.run_id,
            report.failures()
        ),
        RunStatus::Finished => println!("{} Run {} finished", "✓".green(), report.run_id),
    }
}
