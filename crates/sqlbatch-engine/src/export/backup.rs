//! Rotation of partition files that are about to be overwritten

use crate::error::{EngineError, Result};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Subdirectory of an output directory holding backups
pub const BACKUP_DIR: &str = "_backup";

/// Move `path` into `<dir>/_backup/<stem>__<timestamp>.<ext>`
///
/// Afterwards at most `keep` backups of the same partition remain; the oldest
/// by modification time go first. Returns the backup path, or `None` when
/// there was nothing to move.
pub fn backup_existing(path: &Path, extension: &str, keep: usize) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let dir = path
        .parent()
        .ok_or_else(|| EngineError::codec(path, "partition has no parent directory"))?
        .join(BACKUP_DIR);
    fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EngineError::codec(path, "partition name is not valid UTF-8"))?;
    let stem = file_name
        .strip_suffix(&format!(".{extension}"))
        .unwrap_or(file_name);

    let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
    let mut target = dir.join(format!("{stem}__{stamp}.{extension}"));
    let mut n = 1;
    while target.exists() {
        target = dir.join(format!("{stem}__{stamp}_{n}.{extension}"));
        n += 1;
    }

    fs::rename(path, &target)?;
    info!(from = %path.display(), to = %target.display(), "existing partition backed up");

    evict(&dir, stem, extension, keep)?;
    Ok(Some(target))
}

fn evict(dir: &Path, stem: &str, extension: &str, keep: usize) -> Result<()> {
    let prefix = format!("{stem}__");
    let suffix = format!(".{extension}");

    let mut backups = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(&suffix) {
            continue;
        }
        // a longer partition name sharing this prefix is not ours
        let middle = &name[prefix.len()..name.len() - suffix.len()];
        if !middle.starts_with(|c: char| c.is_ascii_digit()) || middle.contains("__") {
            continue;
        }
        backups.push((entry.metadata()?.modified()?, name, entry.path()));
    }

    if backups.len() <= keep {
        return Ok(());
    }

    backups.sort();
    let excess = backups.len() - keep;
    for (_, name, path) in backups.into_iter().take(excess) {
        fs::remove_file(&path)?;
        debug!(backup = %name, "old backup evicted");
    }

    Ok(())
}
