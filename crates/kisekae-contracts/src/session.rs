use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;

/// Extension used when an artifact reference carries no recognizable suffix.
pub const FALLBACK_EXTENSION: &str = "webp";

/// Timestamp for one batch run, taken once at session start and reused for
/// every file name produced during that run.
pub fn session_timestamp() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// One timestamped batch run and its output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    timestamp: String,
    dir: PathBuf,
}

impl Session {
    /// Creates `<base_dir>/<timestamp>` (and `base_dir` itself, recursively,
    /// if absent). Idempotent: an already-existing directory is not an error.
    pub fn create(base_dir: &Path, timestamp: &str) -> Result<Self> {
        let dir = base_dir.join(timestamp);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create session directory {}", dir.display()))?;
        Ok(Self {
            timestamp: timestamp.to_string(),
            dir,
        })
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.dir.join(relative)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(format!("{}_results.zip", self.timestamp))
    }
}

/// File name for one persisted artifact. Injective over
/// `(source_index, artifact_index)` within a session, and lexically sortable
/// in item-then-artifact order for the fixed-width index range.
pub fn artifact_file_name(
    timestamp: &str,
    source_index: usize,
    artifact_index: usize,
    extension: &str,
) -> String {
    format!("{timestamp}_{source_index:03}_{artifact_index:02}.{extension}")
}

/// Sniffs a file extension from an artifact reference: any query component is
/// stripped before the trailing dotted segment of the last path component is
/// inspected. Falls back to [`FALLBACK_EXTENSION`].
pub fn extension_for_reference(reference: &str) -> String {
    let without_query = reference.split('?').next().unwrap_or(reference);
    let file_name = without_query.rsplit('/').next().unwrap_or(without_query);
    match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => FALLBACK_EXTENSION.to_string(),
    }
}
