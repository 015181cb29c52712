//! Plan mode: render every unit without touching a database

use super::{build_units, ExportSummary, QueryFile};
use crate::context::PipelineContext;
use crate::error::Result;
use crate::params::ParameterCase;
use crate::partition::PartitionFormat;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{error, info};

/// Lines of context kept around matched parameter values
const PREVIEW_CONTEXT: usize = 5;

/// Lines shown when no parameter value appears in the query
const PREVIEW_HEAD: usize = 10;

const PLAN_RULE: &str = "-- ======================================";

/// The part of a rendered query around its substituted values
///
/// Spans from the first to the last line containing any case value, widened
/// by five lines each way; the first ten lines when nothing matches.
pub fn preview(sql: &str, case: &ParameterCase) -> String {
    let lines: Vec<&str> = sql.lines().collect();
    let hits: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| case.iter().any(|(_, v)| !v.is_empty() && line.contains(v)))
        .map(|(i, _)| i)
        .collect();

    let (start, end) = match (hits.first(), hits.last()) {
        (Some(&first), Some(&last)) => (
            first.saturating_sub(PREVIEW_CONTEXT),
            (last + PREVIEW_CONTEXT + 1).min(lines.len()),
        ),
        _ => (0, PREVIEW_HEAD.min(lines.len())),
    };

    lines[start..end].join("\n")
}

/// Write `<log_dir>/plan_<run_id>.sql` with every rendered unit
pub(super) fn write_plan(
    ctx: &PipelineContext,
    queries: &[QueryFile],
    out_dir: &Path,
    format: PartitionFormat,
) -> Result<ExportSummary> {
    std::fs::create_dir_all(&ctx.log_dir)?;
    let plan_path = ctx.log_dir.join(format!("plan_{}.sql", ctx.run_id));

    let mut plan = String::new();
    let mut summary = ExportSummary::default();
    let mut planned = 0usize;

    for (idx, query) in queries.iter().enumerate() {
        info!("PLAN [{}/{}] {}", idx + 1, queries.len(), query.file_name);

        let units = match build_units(query, &ctx.params, out_dir, format) {
            Ok(units) => units,
            Err(e) => {
                error!(sql_file = %query.file_name, error = %e, "parameter expansion failed");
                let _ = writeln!(plan, "{PLAN_RULE}\n-- FILE: {}\n-- ERROR: {e}\n", query.file_name);
                summary.failed += 1;
                continue;
            }
        };

        for unit in units {
            for line in preview(&unit.sql, &unit.case).lines() {
                info!("  {line}");
            }

            let _ = writeln!(plan, "{PLAN_RULE}");
            let _ = writeln!(plan, "-- FILE: {}", unit.sql_file);
            let _ = writeln!(plan, "-- OUTPUT: {}", unit.output_path.display());
            let _ = writeln!(plan, "-- PARAMS:");
            if unit.case.is_empty() {
                let _ = writeln!(plan, "--   (none)");
            }
            for (k, v) in unit.case.iter() {
                let _ = writeln!(plan, "--   {k} = {v}");
            }
            let _ = writeln!(plan, "\n{}\n", unit.sql);
            planned += 1;
        }
    }

    std::fs::write(&plan_path, plan)?;
    info!(
        plan_file = %plan_path.display(),
        units = planned,
        failed = summary.failed,
        "plan file generated"
    );

    Ok(summary)
}
