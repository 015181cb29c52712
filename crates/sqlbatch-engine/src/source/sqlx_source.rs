//! sqlx-backed source connections
//!
//! Uses the `Any` driver so one binary talks to every database sqlx was built
//! with (Postgres and SQLite here). A running query is streamed by a spawned
//! task that owns the connection and forwards decoded rows through a bounded
//! channel; the connection comes back through the task's join handle once the
//! result set is drained. A result set given up early has a short grace period
//! to hand the connection back, after which the task is aborted and the
//! connection is discarded.

use super::{Connector, Row, SourceConnection};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Column, Connection, Executor, Row as _, Statement};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rows buffered between the streaming task and `fetch`
const ROW_CHANNEL_CAPACITY: usize = 4096;

/// How long an abandoned query may take to release its connection
const RECLAIM_GRACE: Duration = Duration::from_secs(1);

/// Connector for a database URL such as `postgres://...` or `sqlite://...`
pub struct SqlxConnector {
    host: String,
    url: String,
}

impl SqlxConnector {
    pub fn new(host: impl Into<String>, url: impl Into<String>) -> Self {
        sqlx::any::install_default_drivers();
        Self {
            host: host.into(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    async fn connect(&self) -> Result<Box<dyn SourceConnection>> {
        let conn = AnyConnection::connect(&self.url)
            .await
            .map_err(|e| EngineError::source(format!("connect to '{}' failed: {e}", self.host)))?;

        info!(host = %self.host, backend = conn.backend_name(), "source connection opened");

        Ok(Box::new(SqlxSource {
            conn: Some(conn),
            stream: None,
        }))
    }

    fn host(&self) -> &str {
        &self.host
    }
}

type StreamOutcome = (AnyConnection, std::result::Result<(), sqlx::Error>);

struct RowStream {
    rows: mpsc::Receiver<Row>,
    task: JoinHandle<StreamOutcome>,
}

struct SqlxSource {
    conn: Option<AnyConnection>,
    stream: Option<RowStream>,
}

impl SqlxSource {
    /// Wait for a streaming task to hand the connection back
    async fn reclaim(&mut self, stream: RowStream) -> Result<()> {
        let RowStream { rows, task } = stream;
        drop(rows);

        let (conn, outcome) = task
            .await
            .map_err(|e| EngineError::source(format!("row stream task failed: {e}")))?;
        self.conn = Some(conn);
        outcome.map_err(EngineError::from)
    }

    /// Give up on a result set that is still being read
    ///
    /// A query that stops producing rows never notices the closed channel, so
    /// the task is aborted once the grace period runs out.
    async fn abandon(&mut self, stream: RowStream) {
        let RowStream { rows, mut task } = stream;
        drop(rows);

        match tokio::time::timeout(RECLAIM_GRACE, &mut task).await {
            Ok(Ok((conn, _))) => self.conn = Some(conn),
            Ok(Err(e)) => debug!(error = %e, "row stream task ended abnormally"),
            Err(_) => {
                warn!("query did not release its connection; aborting it");
                task.abort();
            }
        }
    }
}

#[async_trait]
impl SourceConnection for SqlxSource {
    async fn execute(&mut self, sql: &str) -> Result<Vec<String>> {
        if let Some(stream) = self.stream.take() {
            self.abandon(stream).await;
        }

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| EngineError::source("connection is closed"))?;

        let columns: Vec<String> = conn
            .prepare(sql)
            .await?
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| EngineError::source("connection is closed"))?;
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let sql = sql.to_string();

        let task = tokio::spawn(async move {
            let outcome = stream_rows(&mut conn, &sql, &tx).await;
            (conn, outcome)
        });

        debug!(columns = columns.len(), "query started");
        self.stream = Some(RowStream { rows: rx, task });

        Ok(columns)
    }

    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::with_capacity(max_rows.min(ROW_CHANNEL_CAPACITY));
        while batch.len() < max_rows {
            let limit = max_rows - batch.len();
            if stream.rows.recv_many(&mut batch, limit).await == 0 {
                break;
            }
        }

        if batch.len() < max_rows {
            // channel closed: the result set is drained or the query failed
            if let Some(stream) = self.stream.take() {
                self.reclaim(stream).await?;
            }
        }

        Ok(batch)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            self.abandon(stream).await;
        }
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

async fn stream_rows(
    conn: &mut AnyConnection,
    sql: &str,
    tx: &mpsc::Sender<Row>,
) -> std::result::Result<(), sqlx::Error> {
    let mut rows = sqlx::query(sql).fetch(conn);
    while let Some(row) = rows.try_next().await? {
        if tx.send(decode_row(&row)?).await.is_err() {
            // reader went away
            break;
        }
    }
    Ok(())
}

fn decode_row(row: &AnyRow) -> std::result::Result<Row, sqlx::Error> {
    (0..row.len()).map(|idx| decode_cell(row, idx)).collect()
}

/// Render one cell as text, trying the value kinds `Any` can carry
fn decode_cell(row: &AnyRow, idx: usize) -> std::result::Result<Option<String>, sqlx::Error> {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map(|n| n.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(v.map(|n| n.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return Ok(v.map(|b| b.to_string()));
    }
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .map(|v| v.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}
