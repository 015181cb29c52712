//! sqlbatch CLI Library
//!
//! Command-line front end for the sqlbatch engine.
//!
//! - **Pipeline Runs**: plan, run or retry a job's stages (`sqlbatch run`)
//! - **Run History**: inspect the latest run ledger (`sqlbatch history`)
//! - **Parameter Preview**: show what a raw parameter expands to (`sqlbatch expand`)

pub mod commands;
pub mod config;
pub mod error;

pub use error::{CliError, Result};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// sqlbatch - parameterised SQL batch export and local load
#[derive(Parser, Debug)]
#[command(name = "sqlbatch")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job's pipeline stages
    Run(RunArgs),

    /// Show the latest run ledger of a job
    History {
        /// Ledger directory (defaults to <workdir>/logs/run_history/<job>)
        #[arg(long)]
        ledger_dir: Option<PathBuf>,

        /// Job name used to locate the default ledger directory
        #[arg(long, default_value = sqlbatch_engine::config::DEFAULT_JOB_NAME)]
        job: String,

        /// Working directory
        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        /// Only show failed units
        #[arg(long)]
        failed: bool,
    },

    /// Print the values a raw parameter expands to
    Expand {
        /// Raw parameter value, e.g. "202401:202412~Q" or "A,B,C"
        raw: String,
    },
}

/// Arguments of `sqlbatch run`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Job file (YAML)
    #[arg(long, env = "SQLBATCH_JOB")]
    pub job: PathBuf,

    /// Environment file with source hosts (YAML)
    #[arg(long, env = "SQLBATCH_ENV_FILE", default_value = config::DEFAULT_ENV_FILE)]
    pub env: PathBuf,

    /// Working directory; relative job paths resolve against it
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// Execution mode: plan, run or retry
    #[arg(long, env = "SQLBATCH_MODE", default_value = "plan")]
    pub mode: String,

    /// Parameter override, repeatable
    #[arg(long = "param", value_name = "K=V")]
    pub params: Vec<String>,

    /// Source host name from the environment file
    #[arg(long)]
    pub host: Option<String>,

    /// Only load partitions whose suffix contains this pair, repeatable
    #[arg(long = "filter", value_name = "K=V")]
    pub filters: Vec<String>,
}
