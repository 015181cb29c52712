//! sqlbatch Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the sqlbatch workspace members.
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Hashing**: content hashes used by the run ledger and the load history
//!
//! # Example
//!
//! ```no_run
//! use sqlbatch_common::hash::hash_file;
//!
//! fn fingerprint(path: &str) -> sqlbatch_common::Result<()> {
//!     let digest = hash_file(path)?;
//!     tracing::info!(%digest, "partition fingerprint");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod hash;
pub mod logging;

pub use error::{CommonError, Result};
