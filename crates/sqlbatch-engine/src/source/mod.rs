//! Source database access
//!
//! The export stage only needs three things from a source: run a query and
//! learn its column names, pull rows in bounded chunks, and close. Those live
//! behind [`SourceConnection`]; [`Connector`] opens fresh connections for
//! workers and for reconnects after a failure.

mod sqlx_source;

pub use sqlx_source::SqlxConnector;

use crate::error::Result;
use async_trait::async_trait;

/// One result row; `None` is SQL NULL
pub type Row = Vec<Option<String>>;

/// An open connection to a source database
#[async_trait]
pub trait SourceConnection: Send {
    /// Start a query and return its column names
    ///
    /// Any result set still being read from a previous call is discarded.
    async fn execute(&mut self, sql: &str) -> Result<Vec<String>>;

    /// Up to `max_rows` further rows; an empty batch means the result set is
    /// exhausted
    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens connections to one configured source host
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SourceConnection>>;

    /// Host identifier recorded in the run ledger
    fn host(&self) -> &str;
}
