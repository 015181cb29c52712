//! Job and environment configuration
//!
//! A job file describes what to run (stages, parameters, directories, target);
//! an environment file maps host names to connection URLs. Both are YAML.
//! Relative paths in a job file are resolved against the working directory.

use crate::error::{EngineError, Result};
use crate::params::ParameterSpec;
use crate::partition::{Compression, FileFormat, PartitionFormat};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================================================
// Configuration Defaults
// ============================================================================

/// Job name used when a job file omits one.
pub const DEFAULT_JOB_NAME: &str = "unnamed_job";

/// Directory holding export query files.
pub const DEFAULT_SQL_DIR: &str = "sql/export";

/// Directory holding SQL run against the local store after loading.
pub const DEFAULT_POSTWORK_DIR: &str = "sql/postwork";

/// Root directory for partition files.
pub const DEFAULT_OUT_DIR: &str = "data/export";

/// Destination database file.
pub const DEFAULT_DB_PATH: &str = "data/local/result.sqlite";

/// Backups kept per output directory.
pub const DEFAULT_BACKUP_KEEP: usize = 10;

/// Concurrent export workers.
pub const DEFAULT_WORKERS: usize = 1;

/// Rows per fetch call.
pub const DEFAULT_FETCH_SIZE: usize = 10_000;

/// Seconds a single fetch may make no progress before it is abandoned.
pub const DEFAULT_STALL_SECONDS: u64 = 1800;

/// Rows in the slow-query report.
pub const DEFAULT_REPORT_TOP_N: usize = 10;

/// Environment variable selecting the source host.
pub const ENV_HOST: &str = "SQLBATCH_HOST";

/// Environment variable overriding the selected host's URL.
pub const ENV_SOURCE_URL: &str = "SQLBATCH_SOURCE_URL";

/// Parsed job file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_job_name")]
    pub job_name: String,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Raw parameter values; scalars of any YAML type are read as text
    #[serde(default, deserialize_with = "deserialize_params")]
    pub params: ParameterSpec,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub postwork: PostworkConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stage names in execution order
    #[serde(default)]
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Host name looked up in the environment file
    pub host: Option<String>,
}

/// Export stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub sql_dir: PathBuf,
    pub out_dir: PathBuf,
    pub format: FileFormat,
    pub compression: Compression,
    pub overwrite: bool,
    pub backup_keep: usize,
    pub workers: usize,
    pub fetch_size: usize,
    pub stall_seconds: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            sql_dir: PathBuf::from(DEFAULT_SQL_DIR),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            format: FileFormat::Csv,
            compression: Compression::None,
            overwrite: false,
            backup_keep: DEFAULT_BACKUP_KEEP,
            workers: DEFAULT_WORKERS,
            fetch_size: DEFAULT_FETCH_SIZE,
            stall_seconds: DEFAULT_STALL_SECONDS,
        }
    }
}

impl ExportConfig {
    pub fn partition_format(&self) -> PartitionFormat {
        PartitionFormat::new(self.format, self.compression)
    }
}

/// How the loader decides a file was already loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupMode {
    /// Same (schema, table, suffix) was loaded before
    #[default]
    Suffix,
    /// Same (schema, table, file content hash) was loaded before
    Hash,
}

/// Load stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub db_path: PathBuf,
    /// Destination schema; the job name when unset
    pub schema: Option<String>,
    pub dedup: DedupMode,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            schema: None,
            dedup: DedupMode::Suffix,
        }
    }
}

/// Post-load SQL settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostworkConfig {
    pub sql_dir: PathBuf,
}

impl Default for PostworkConfig {
    fn default() -> Self {
        Self {
            sql_dir: PathBuf::from(DEFAULT_POSTWORK_DIR),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub top_n: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_REPORT_TOP_N,
        }
    }
}

fn default_job_name() -> String {
    DEFAULT_JOB_NAME.to_string()
}

fn deserialize_params<'de, D>(deserializer: D) -> std::result::Result<ParameterSpec, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_yaml::Value>> = Option::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Null => String::new(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "parameter '{key}' must be a scalar, got {other:?}"
                    )))
                }
            };
            Ok((key, text))
        })
        .collect()
}

impl JobConfig {
    /// Read and validate a job file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("cannot read job file '{}': {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(EngineError::config("job_name cannot be empty"));
        }

        if self.job_name.contains(['/', '\\']) {
            return Err(EngineError::config(format!(
                "job_name '{}' must not contain path separators",
                self.job_name
            )));
        }

        if self.export.workers == 0 {
            return Err(EngineError::config("export.workers must be greater than 0"));
        }

        if self.export.fetch_size == 0 {
            return Err(EngineError::config(
                "export.fetch_size must be greater than 0",
            ));
        }

        if self.export.stall_seconds == 0 {
            return Err(EngineError::config(
                "export.stall_seconds must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Anchor every relative path at `workdir`
    pub fn resolve_paths(&mut self, workdir: &Path) {
        for path in [
            &mut self.export.sql_dir,
            &mut self.export.out_dir,
            &mut self.target.db_path,
            &mut self.postwork.sql_dir,
        ] {
            if path.is_relative() {
                *path = workdir.join(&*path);
            }
        }
    }

    /// Destination schema name
    pub fn schema(&self) -> &str {
        self.target.schema.as_deref().unwrap_or(&self.job_name)
    }

    /// Partition directory of this job
    pub fn job_out_dir(&self) -> PathBuf {
        self.export.out_dir.join(&self.job_name)
    }
}

/// Parsed environment file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvConfig {
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub default_host: Option<String>,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// sqlx connection URL, e.g. `postgres://user:pass@db/sales`
    pub url: String,
}

/// Host chosen for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub name: String,
    pub url: String,
}

impl EnvConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("cannot read env file '{}': {e}", path.display()))
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Pick the source host and its URL
    ///
    /// Host precedence: explicit override, `SQLBATCH_HOST`, the job's
    /// `source.host`, then `sources.default_host`. `SQLBATCH_SOURCE_URL`
    /// replaces the URL of whichever host wins, and also stands in for a
    /// host missing from the file.
    pub fn resolve_host(&self, explicit: Option<&str>, job_host: Option<&str>) -> Result<ResolvedHost> {
        let env_host = std::env::var(ENV_HOST).ok();
        let name = explicit
            .map(str::to_string)
            .or(env_host)
            .or_else(|| job_host.map(str::to_string))
            .or_else(|| self.sources.default_host.clone())
            .ok_or_else(|| {
                EngineError::config("no source host selected (set source.host or sources.default_host)")
            })?;

        let url = match std::env::var(ENV_SOURCE_URL) {
            Ok(url) if !url.trim().is_empty() => url,
            _ => self
                .sources
                .hosts
                .get(&name)
                .map(|h| h.url.clone())
                .ok_or_else(|| {
                    EngineError::config(format!("host '{name}' is not defined in sources.hosts"))
                })?,
        };

        Ok(ResolvedHost { name, url })
    }
}
