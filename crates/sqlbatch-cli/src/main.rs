//! sqlbatch CLI - Main entry point

use clap::Parser;
use sqlbatch_cli::{Cli, Commands};
use sqlbatch_common::logging::{init_logging, LogConfig, LogOutput};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn, Level};

#[tokio::main]
async fn main() {
    // .env first, so clap's env fallbacks and SQLBATCH_* lookups see it
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let base = LogConfig::builder()
        .level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .output(LogOutput::Console)
        .log_file_prefix("sqlbatch")
        .build();

    // LOG_* variables take precedence
    let log_config = base.clone().merge_env().unwrap_or(base);

    // the CLI works without logging
    let _ = init_logging(&log_config);

    match execute_command(&cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Execute the CLI command, returning the process exit code
async fn execute_command(cli: &Cli) -> sqlbatch_cli::Result<i32> {
    match &cli.command {
        Commands::Run(args) => {
            let cancel = CancellationToken::new();
            let signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight units");
                    signal.cancel();
                }
            });

            sqlbatch_cli::commands::run::run(args, cancel).await
        }

        Commands::History {
            ledger_dir,
            job,
            workdir,
            failed,
        } => {
            sqlbatch_cli::commands::history::run(ledger_dir.as_deref(), job, workdir, *failed)?;
            Ok(0)
        }

        Commands::Expand { raw } => {
            sqlbatch_cli::commands::expand::run(raw)?;
            Ok(0)
        }
    }
}
