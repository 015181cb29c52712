//! Export workers
//!
//! Each worker owns at most one source connection, opened on its first unit
//! and reused until the queue is drained. A failed attempt drops the
//! connection; the next attempt reconnects and re-runs the same rendered query.

use super::{backup, ExportSummary, ExportUnit};
use crate::codec::PartitionWriter;
use crate::error::{EngineError, Result};
use crate::ledger::{truncate_error, RunHistoryRecord, RunLedger, UnitStatus};
use crate::partition::PartitionFormat;
use crate::source::{Connector, SourceConnection};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts per unit before the stage is halted
pub const MAX_ATTEMPTS: u32 = 3;

/// Pause before attempt `n + 1` is `n` times this
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Per-unit progress is logged every `fetch_size * PROGRESS_EVERY_FETCHES` rows
const PROGRESS_EVERY_FETCHES: u64 = 5;

#[derive(Debug, Clone)]
pub(super) struct WorkerSettings {
    pub format: PartitionFormat,
    pub fetch_size: usize,
    pub stall: Duration,
    pub backup_keep: usize,
}

/// What a worker did before it stopped
pub(super) struct WorkerOutcome {
    pub summary: ExportSummary,
    /// Set when a unit exhausted its attempts
    pub error: Option<EngineError>,
}

pub(super) struct ExportWorker {
    id: usize,
    connector: Arc<dyn Connector>,
    ledger: Arc<RunLedger>,
    settings: WorkerSettings,
    halt: CancellationToken,
    conn: Option<Box<dyn SourceConnection>>,
}

impl ExportWorker {
    pub fn new(
        id: usize,
        connector: Arc<dyn Connector>,
        ledger: Arc<RunLedger>,
        settings: WorkerSettings,
        halt: CancellationToken,
    ) -> Self {
        Self {
            id,
            connector,
            ledger,
            settings,
            halt,
            conn: None,
        }
    }

    /// Pull units until the queue closes or the stage is halted
    pub async fn run(mut self, queue: Arc<Mutex<mpsc::Receiver<ExportUnit>>>) -> WorkerOutcome {
        let mut summary = ExportSummary::default();
        let mut error = None;

        loop {
            let next = queue.lock().await.recv().await;
            let Some(unit) = next else { break };

            if self.halt.is_cancelled() {
                debug!(worker = self.id, unit = %unit.label(), "halted; unit dropped");
                break;
            }

            match self.execute(&unit).await {
                Ok(rows) => {
                    summary.executed += 1;
                    summary.rows += rows;
                }
                Err(e) => {
                    summary.failed += 1;
                    self.halt.cancel();
                    error = Some(e);
                    break;
                }
            }
        }

        self.disconnect().await;
        debug!(worker = self.id, executed = summary.executed, "worker finished");

        WorkerOutcome { summary, error }
    }

    /// Run one unit with retries and record the outcome in the ledger
    async fn execute(&mut self, unit: &ExportUnit) -> Result<u64> {
        let started = Instant::now();
        info!(worker = self.id, unit = %unit.label(), "export unit starting");

        let extension = self.settings.format.extension();
        backup::backup_existing(&unit.output_path, extension, self.settings.backup_keep)?;

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(unit).await {
                Ok(rows) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    if rows == 0 {
                        warn!(unit = %unit.label(), "query returned no rows");
                    }
                    info!(
                        worker = self.id,
                        unit = %unit.label(),
                        rows,
                        elapsed_sec = elapsed,
                        "export unit done"
                    );
                    self.ledger.append(&self.record(unit, UnitStatus::Ok, rows, elapsed, ""))?;
                    return Ok(rows);
                }
                Err(e) => {
                    warn!(
                        worker = self.id,
                        unit = %unit.label(),
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        error = %e,
                        "export attempt failed"
                    );
                    self.disconnect().await;
                    last_error = Some(e);

                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    }
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        let elapsed = started.elapsed().as_secs_f64();
        error!(unit = %unit.label(), error = %message, "export unit failed; halting stage");
        self.ledger
            .append(&self.record(unit, UnitStatus::Fail, 0, elapsed, &message))?;

        Err(EngineError::RetriesExhausted {
            unit: unit.label(),
            attempts: MAX_ATTEMPTS,
            message,
        })
    }

    async fn attempt(&mut self, unit: &ExportUnit) -> Result<u64> {
        let fetch_size = self.settings.fetch_size;
        let stall = self.settings.stall;
        let format = self.settings.format;
        let progress_step = fetch_size as u64 * PROGRESS_EVERY_FETCHES;

        let conn = self.connection().await?;
        let columns = conn.execute(&unit.sql).await?;
        let mut writer = PartitionWriter::create(&unit.output_path, format, &columns)?;

        let mut next_progress = progress_step;
        loop {
            let batch = tokio::time::timeout(stall, conn.fetch(fetch_size))
                .await
                .map_err(|_| EngineError::Stalled(stall.as_secs()))??;
            if batch.is_empty() {
                break;
            }

            writer.write_batch(&batch)?;
            if writer.rows() >= next_progress {
                info!(unit = %unit.label(), rows = writer.rows(), "fetching");
                next_progress += progress_step;
            }
        }

        writer.commit()
    }

    async fn connection(&mut self) -> Result<&mut Box<dyn SourceConnection>> {
        if self.conn.is_none() {
            debug!(worker = self.id, host = self.connector.host(), "connecting");
            self.conn = Some(self.connector.connect().await?);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::source("connection unavailable"))
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!(worker = self.id, error = %e, "error while closing connection");
            }
        }
    }

    fn record(
        &self,
        unit: &ExportUnit,
        status: UnitStatus,
        rows: u64,
        elapsed_sec: f64,
        error_message: &str,
    ) -> RunHistoryRecord {
        RunHistoryRecord {
            run_ts: Utc::now(),
            host: self.connector.host().to_string(),
            sql_file: unit.sql_file.clone(),
            params: unit.case.description(),
            sql_hash: unit.sql_hash.clone(),
            status,
            rows,
            elapsed_sec,
            output_file: unit.output_path.display().to_string(),
            error_message: truncate_error(error_message),
        }
    }
}
