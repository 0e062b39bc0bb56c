use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// End-of-run accounting, written to `summary.json` inside the session
/// directory of an autosave run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub session: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_inputs: u64,
    pub total_artifacts: u64,
    pub saved_files: Vec<String>,
    pub failed_items: u64,
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let mut payload = serde_json::to_value(summary)?;
    if let Some(object) = payload.as_object_mut() {
        object.insert("ts".to_string(), Value::String(now_utc_iso()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
