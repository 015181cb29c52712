//! Shared fixtures for engine integration tests
//!
//! [`ScriptedConnector`] stands in for a source database. Every rendered query
//! returns `ID, LABEL` rows; substrings of the query text select the row count
//! and the failures to inject.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use sqlbatch_engine::config::JobConfig;
use sqlbatch_engine::context::{PipelineContext, RunMode, RunOptions};
use sqlbatch_engine::error::{EngineError, Result};
use sqlbatch_engine::ledger::{read_records, RunHistoryRecord};
use sqlbatch_engine::source::{Connector, Row, SourceConnection};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const HOST: &str = "fake";

/// Rows returned when no `rows_for` entry matches
pub const DEFAULT_ROWS: usize = 3;

/// Behaviour of the fake source, keyed by substrings of the query text
#[derive(Default)]
pub struct Script {
    /// Every query text passed to `execute`, in order
    pub executed: Vec<String>,
    pub rows_for: HashMap<String, usize>,
    /// `execute` fails this many more times
    pub execute_failures: HashMap<String, u32>,
    /// the second `fetch` fails this many more times
    pub fetch_failures: HashMap<String, u32>,
    /// the first `fetch` hangs this many more times
    pub stalls: HashMap<String, u32>,
    pub connects: usize,
    pub closes: usize,
}

fn take_one(counts: &mut HashMap<String, u32>, sql: &str) -> bool {
    for (pattern, remaining) in counts.iter_mut() {
        if *remaining > 0 && sql.contains(pattern.as_str()) {
            *remaining -= 1;
            return true;
        }
    }
    false
}

type ExecuteHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ScriptedConnector {
    pub script: Arc<Mutex<Script>>,
    on_execute: Option<ExecuteHook>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            on_execute: None,
        }
    }

    /// Call `hook` with every query text after it is recorded
    pub fn on_execute(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(hook));
        self
    }

    pub fn rows_for(&self, pattern: &str, rows: usize) {
        self.script.lock().unwrap().rows_for.insert(pattern.to_string(), rows);
    }

    pub fn fail_execute(&self, pattern: &str, times: u32) {
        self.script
            .lock()
            .unwrap()
            .execute_failures
            .insert(pattern.to_string(), times);
    }

    pub fn fail_fetch(&self, pattern: &str, times: u32) {
        self.script
            .lock()
            .unwrap()
            .fetch_failures
            .insert(pattern.to_string(), times);
    }

    pub fn stall(&self, pattern: &str, times: u32) {
        self.script.lock().unwrap().stalls.insert(pattern.to_string(), times);
    }

    pub fn executed(&self) -> Vec<String> {
        self.script.lock().unwrap().executed.clone()
    }

    /// Connections opened and closed so far
    pub fn connections(&self) -> (usize, usize) {
        let script = self.script.lock().unwrap();
        (script.connects, script.closes)
    }

    pub fn clear_executed(&self) {
        self.script.lock().unwrap().executed.clear();
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn SourceConnection>> {
        self.script.lock().unwrap().connects += 1;
        Ok(Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
            on_execute: self.on_execute.clone(),
            pending: VecDeque::new(),
            fail_second_fetch: false,
            stall_first_fetch: false,
            fetches: 0,
        }))
    }

    fn host(&self) -> &str {
        HOST
    }
}

struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
    on_execute: Option<ExecuteHook>,
    pending: VecDeque<Row>,
    fail_second_fetch: bool,
    stall_first_fetch: bool,
    fetches: usize,
}

#[async_trait]
impl SourceConnection for ScriptedConnection {
    async fn execute(&mut self, sql: &str) -> Result<Vec<String>> {
        let rows = {
            let mut script = self.script.lock().unwrap();
            script.executed.push(sql.to_string());

            if take_one(&mut script.execute_failures, sql) {
                return Err(EngineError::source("scripted execute failure"));
            }
            self.fail_second_fetch = take_one(&mut script.fetch_failures, sql);
            self.stall_first_fetch = take_one(&mut script.stalls, sql);

            script
                .rows_for
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map_or(DEFAULT_ROWS, |(_, rows)| *rows)
        };

        if let Some(hook) = &self.on_execute {
            hook(sql);
        }

        self.fetches = 0;
        self.pending = (1..=rows)
            .map(|i| vec![Some(i.to_string()), (i % 2 == 1).then(|| format!("row {i}"))])
            .collect();
        Ok(vec!["ID".to_string(), "LABEL".to_string()])
    }

    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        self.fetches += 1;
        if self.fetches == 1 && self.stall_first_fetch {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
        if self.fetches == 2 && self.fail_second_fetch {
            return Err(EngineError::source("scripted fetch failure"));
        }

        let take = max_rows.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.script.lock().unwrap().closes += 1;
        self.pending.clear();
        Ok(())
    }
}

/// A work directory with query files under `sql/export`
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new(queries: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        let sql_dir = dir.path().join("sql/export");
        std::fs::create_dir_all(&sql_dir).unwrap();
        for (name, text) in queries {
            std::fs::write(sql_dir.join(name), text).unwrap();
        }
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_query(&self, name: &str, text: &str) {
        std::fs::write(self.path().join("sql/export").join(name), text).unwrap();
    }

    /// Job named `job` with the given YAML appended
    pub fn job(&self, extra_yaml: &str) -> JobConfig {
        let yaml = format!("job_name: job\n{extra_yaml}");
        serde_yaml::from_str(&yaml).unwrap()
    }

    pub fn context(&self, job: JobConfig, mode: RunMode, cancel: CancellationToken) -> PipelineContext {
        let options = RunOptions {
            workdir: self.path().to_path_buf(),
            mode,
            host: HOST.to_string(),
            ..Default::default()
        };
        PipelineContext::create(job, options, cancel).unwrap()
    }

    pub fn export_dir(&self) -> std::path::PathBuf {
        self.path().join("data/export/job")
    }

    /// Names of the regular files in the job's export directory
    pub fn export_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.export_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().unwrap().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Ledger rows of one run; empty when the run wrote none
pub fn ledger_records(ctx: &PipelineContext) -> Vec<RunHistoryRecord> {
    let path = ctx.ledger_dir().join(format!("{}.csv", ctx.run_id));
    if !path.exists() {
        return Vec::new();
    }
    read_records(&path).unwrap()
}
