//! sqlbatch Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Parameterised batch export of SQL query results into partition files, and
//! incremental loading of those files into a local SQLite store.
//!
//! # Pipeline
//!
//! - **Export**: every query file in the SQL directory is expanded over its
//!   parameter cases; each (query, case) unit streams its result into one
//!   partition file, and the outcome is appended to the run ledger
//! - **Load**: partition files become physical tables in the local store, and
//!   each partitioned logical table is exposed as a UNION ALL view
//! - **Postwork**: SQL scripts run against the local store after loading
//! - **Report**: the slowest units of the run are written to a CSV file
//!
//! # Example
//!
//! ```no_run
//! use sqlbatch_engine::config::JobConfig;
//! use sqlbatch_engine::context::{PipelineContext, RunMode, RunOptions};
//! use sqlbatch_engine::pipeline::run_pipeline;
//! use sqlbatch_engine::source::SqlxConnector;
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> sqlbatch_engine::Result<()> {
//!     let job = JobConfig::from_file(Path::new("jobs/monthly_sales.yml"))?;
//!     let options = RunOptions {
//!         mode: RunMode::Run,
//!         host: "local".to_string(),
//!         ..Default::default()
//!     };
//!     let ctx = PipelineContext::create(job, options, CancellationToken::new())?;
//!     let connector = Arc::new(SqlxConnector::new("local", "sqlite://data/source.db"));
//!
//!     let report = run_pipeline(&ctx, connector).await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod ledger;
pub mod load;
pub mod params;
pub mod partition;
pub mod pipeline;
pub mod postwork;
pub mod report;
pub mod source;
pub mod store;

pub use context::{PipelineContext, RunMode, RunOptions};
pub use error::{EngineError, Result};
pub use pipeline::{run_pipeline, RunReport, RunStatus, Stage};
