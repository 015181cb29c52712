//! `sqlbatch history` command implementation
//!
//! Prints the most recent run ledger of a job.

use crate::error::Result;
use colored::Colorize;
use sqlbatch_engine::context::ledger_dir;
use sqlbatch_engine::ledger::{latest_ledger, read_records, UnitStatus};
use std::path::{Path, PathBuf};

/// Execute history command
pub fn run(ledger_dir_arg: Option<&Path>, job: &str, workdir: &Path, failed_only: bool) -> Result<()> {
    let dir: PathBuf = ledger_dir_arg
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ledger_dir(&workdir.join("logs"), job));

    let Some(path) = latest_ledger(&dir, None)? else {
        println!("{} No run history in {}", "→".cyan(), dir.display());
        return Ok(());
    };

    let records = read_records(&path)?;
    let ok = records.iter().filter(|r| r.status == UnitStatus::Ok).count();
    let failed = records.len() - ok;

    println!(
        "{} {} ({} OK, {} FAIL)",
        "→".cyan(),
        path.display(),
        ok,
        failed
    );
    println!();

    for record in records
        .iter()
        .filter(|r| !failed_only || r.status == UnitStatus::Fail)
    {
        let status = match record.status {
            UnitStatus::Ok => "OK  ".green(),
            UnitStatus::Fail => "FAIL".red(),
        };
        println!(
            "{} {} [{}] rows={} {:.2}s {}",
            status,
            record.sql_file.bold(),
            record.params,
            record.rows,
            record.elapsed_sec,
            record.run_ts.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
        if !record.error_message.is_empty() {
            println!("     {}", record.error_message.bright_black());
        }
    }

    Ok(())
}
