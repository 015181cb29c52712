//! Configuration loading for the CLI
//!
//! Resolves the job file, the environment file and the `k=v` arguments into
//! what the engine needs. `.env` is read by `main` before any of this runs.

use crate::error::{CliError, Result};
use sqlbatch_engine::config::{EnvConfig, JobConfig, ResolvedHost};
use sqlbatch_engine::context::RunMode;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ============================================================================
// CLI Configuration Constants
// ============================================================================

/// Environment file used when `--env` is not given
pub const DEFAULT_ENV_FILE: &str = "config/env.yml";

/// Host name recorded when plan mode runs without a configured source
pub const PLAN_HOST: &str = "-";

/// Split repeated `KEY=VALUE` arguments
///
/// Keys are trimmed and must be non-empty; values are kept as given, so
/// `m=202401:202412~Q` survives intact.
pub fn parse_pairs(values: &[String], what: &'static str) -> Result<Vec<(String, String)>> {
    values
        .iter()
        .map(|raw| {
            let (key, value) = raw
                .split_once('=')
                .ok_or_else(|| CliError::invalid_pair(what, raw.as_str()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(CliError::invalid_pair(what, raw.as_str()));
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Anchor a relative path at the working directory
pub fn resolve(workdir: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        workdir.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Read and validate a job file
pub fn load_job(path: &Path) -> Result<JobConfig> {
    if !path.is_file() {
        return Err(CliError::FileNotFound(path.display().to_string()));
    }
    let job = JobConfig::from_file(path)?;
    debug!(job = %job.job_name, path = %path.display(), "job file loaded");
    Ok(job)
}

/// Read the environment file; a missing file yields an empty configuration
///
/// Without the file a source can still be reached through
/// `SQLBATCH_SOURCE_URL`.
pub fn load_env(path: &Path) -> Result<EnvConfig> {
    if !path.is_file() {
        warn!(path = %path.display(), "env file not found; only SQLBATCH_* variables apply");
        return Ok(EnvConfig::default());
    }
    Ok(EnvConfig::from_file(path)?)
}

/// Pick the source for a run
///
/// Plan mode never connects, so an unresolvable host is only a warning there.
pub fn resolve_source(
    env: &EnvConfig,
    explicit: Option<&str>,
    job: &JobConfig,
    mode: RunMode,
) -> Result<ResolvedHost> {
    match env.resolve_host(explicit, job.source.host.as_deref()) {
        Ok(host) => Ok(host),
        Err(e) if mode == RunMode::Plan => {
            warn!(error = %e, "no usable source host; plan mode continues without one");
            let name = explicit
                .or(job.source.host.as_deref())
                .unwrap_or(PLAN_HOST)
                .to_string();
            Ok(ResolvedHost {
                name,
                url: String::new(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs(&strings(&["m=202401:202412~Q", " r = KR,US"]), "param").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("m".to_string(), "202401:202412~Q".to_string()),
                ("r".to_string(), "KR,US".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_pairs_rejects_missing_key_or_separator() {
        assert!(matches!(
            parse_pairs(&strings(&["novalue"]), "param"),
            Err(CliError::InvalidPair { what: "param", .. })
        ));
        assert!(parse_pairs(&strings(&["=1"]), "filter").is_err());
    }

    #[test]
    fn test_resolve_keeps_absolute_paths() {
        let workdir = Path::new("/work");
        assert_eq!(resolve(workdir, Path::new("jobs/a.yml")), PathBuf::from("/work/jobs/a.yml"));
        assert_eq!(resolve(workdir, Path::new("/etc/a.yml")), PathBuf::from("/etc/a.yml"));
    }

    #[test]
    fn test_missing_env_file_is_empty() {
        let env = load_env(Path::new("/definitely/not/here.yml")).unwrap();
        assert!(env.sources.hosts.is_empty());
    }

    #[test]
    fn test_plan_mode_tolerates_missing_host() {
        let job: JobConfig = job_from_yaml("job_name: j\nsource:\n  host: nowhere\n");
        let env = EnvConfig::default();

        if std::env::var(sqlbatch_engine::config::ENV_SOURCE_URL).is_err()
            && std::env::var(sqlbatch_engine::config::ENV_HOST).is_err()
        {
            let host = resolve_source(&env, None, &job, RunMode::Plan).unwrap();
            assert_eq!(host.name, "nowhere");
            assert!(resolve_source(&env, None, &job, RunMode::Run).is_err());
        }
    }

    fn job_from_yaml(yaml: &str) -> JobConfig {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job.yml");
        std::fs::write(&path, yaml).unwrap();
        load_job(&path).unwrap()
    }
}
