//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod expand;
pub mod history;
pub mod run;
