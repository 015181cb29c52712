//! Report stage: slow-query statistics for the current run

use crate::context::{PipelineContext, RunMode};
use crate::error::Result;
use crate::ledger::{RunHistoryRecord, RunLedger, UnitStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Outcome counts of the current run plus the slow-query file, if written
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub ok: usize,
    pub failed: usize,
    pub total_rows: u64,
    pub slow_sql_file: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SlowSqlRow<'a> {
    rank: usize,
    sql_file: &'a str,
    params: &'a str,
    rows: u64,
    elapsed_sec: f64,
    output_file: &'a str,
}

/// Summarise this run's ledger and write the slowest OK units
pub fn run_report(ctx: &PipelineContext, ledger: &RunLedger) -> Result<ReportSummary> {
    if ctx.mode == RunMode::Plan {
        info!("plan mode: report stage skipped");
        return Ok(ReportSummary::default());
    }

    let records = ledger.records()?;
    if records.is_empty() {
        info!("nothing executed in this run; no report");
        return Ok(ReportSummary::default());
    }

    let path = ctx
        .log_dir
        .join(format!("slow_sql_top{}_{}.csv", ctx.job.report.top_n, ctx.run_id));
    write_report(&records, ctx.job.report.top_n, &path)
}

/// Write the `top_n` slowest OK records of `records` to `path`
pub fn write_report(records: &[RunHistoryRecord], top_n: usize, path: &Path) -> Result<ReportSummary> {
    let mut summary = ReportSummary::default();
    for record in records {
        match record.status {
            UnitStatus::Ok => {
                summary.ok += 1;
                summary.total_rows += record.rows;
            }
            UnitStatus::Fail => summary.failed += 1,
        }
    }

    let mut slowest: Vec<&RunHistoryRecord> = records
        .iter()
        .filter(|r| r.status == UnitStatus::Ok)
        .collect();
    slowest.sort_by(|a, b| b.elapsed_sec.total_cmp(&a.elapsed_sec));
    slowest.truncate(top_n);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for (idx, record) in slowest.iter().enumerate() {
        writer.serialize(SlowSqlRow {
            rank: idx + 1,
            sql_file: &record.sql_file,
            params: &record.params,
            rows: record.rows,
            elapsed_sec: record.elapsed_sec,
            output_file: &record.output_file,
        })?;
    }
    writer.flush()?;

    info!(
        ok = summary.ok,
        failed = summary.failed,
        rows = summary.total_rows,
        file = %path.display(),
        "run report written"
    );

    summary.slow_sql_file = Some(path.to_path_buf());
    Ok(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(sql_file: &str, status: UnitStatus, elapsed_sec: f64) -> RunHistoryRecord {
        RunHistoryRecord {
            run_ts: Utc::now(),
            host: "local".to_string(),
            sql_file: sql_file.to_string(),
            params: "m=1".to_string(),
            sql_hash: "h".to_string(),
            status,
            rows: 4,
            elapsed_sec,
            output_file: format!("{sql_file}.csv"),
            error_message: String::new(),
        }
    }

    #[test]
    fn test_report_ranks_slowest_ok_units() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slow.csv");
        let records = vec![
            record("a.sql", UnitStatus::Ok, 1.0),
            record("b.sql", UnitStatus::Ok, 9.0),
            record("c.sql", UnitStatus::Fail, 50.0),
            record("d.sql", UnitStatus::Ok, 3.5),
        ];

        let summary = write_report(&records, 2, &path).unwrap();
        assert_eq!(summary.ok, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_rows, 12);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let files: Vec<String> = reader
            .records()
            .map(|r| r.unwrap().get(1).unwrap().to_string())
            .collect();
        assert_eq!(files, vec!["b.sql", "d.sql"]);
    }

    #[test]
    fn test_report_with_only_failures_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("slow.csv");

        let summary = write_report(&[record("a.sql", UnitStatus::Fail, 1.0)], 10, &path).unwrap();
        assert_eq!(summary.ok, 0);
        assert!(path.exists());
        assert_eq!(csv::Reader::from_path(&path).unwrap().records().count(), 0);
    }
}
