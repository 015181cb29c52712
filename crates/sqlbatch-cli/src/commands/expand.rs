//! `sqlbatch expand` command implementation

use crate::error::Result;
use sqlbatch_engine::params;

/// Print every value `raw` expands to, one per line
pub fn run(raw: &str) -> Result<()> {
    for value in params::expand(raw)? {
        println!("{value}");
    }
    Ok(())
}
