use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub(crate) const STATUS_FILE: &str = "status.json";

/// Last-known loop state for observers. Rewritten whole after every
/// iteration; never read back by the loop itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StatusSnapshot {
    pub(crate) timestamp: DateTime<Local>,
    pub(crate) status: String,
    pub(crate) loop_count: u64,
    #[serde(default)]
    pub(crate) current_story: Option<String>,
    pub(crate) stories_complete: usize,
    pub(crate) stories_total: usize,
    pub(crate) calls_this_hour: u32,
    pub(crate) max_calls_per_hour: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) last_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) next_reset: Option<DateTime<Local>>,
}

/// Writes `value` as pretty JSON through a sibling temp file and rename so
/// readers never observe a half-written document.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .map_err(|err| format!("Failed to create directory {}: {}", parent.display(), err))?;
    let mut file = NamedTempFile::new_in(parent)
        .map_err(|err| format!("Failed to create temp file in {}: {}", parent.display(), err))?;
    serde_json::to_writer_pretty(&mut file, value)
        .map_err(|err| format!("Failed to serialize {}: {}", path.display(), err))?;
    file.write_all(b"\n")
        .map_err(|err| format!("Failed to write {}: {}", path.display(), err))?;
    file.persist(path)
        .map_err(|err| format!("Failed to replace {}: {}", path.display(), err.error))?;
    Ok(())
}

pub(crate) fn publish_status(path: &Path, snapshot: &StatusSnapshot) -> Result<(), String> {
    write_json_atomic(path, snapshot)
}

/// Missing or malformed snapshots read as `None`; they can always be regenerated.
pub(crate) fn read_status(path: &Path) -> Option<StatusSnapshot> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}
