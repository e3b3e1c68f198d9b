//! Persistent task state.
//!
//! Each running task is recorded in `<state_dir>/<task id>.json`, enough to
//! re-attach to its container after a supervisor restart. Files are
//! replaced atomically so a crash never leaves a half-written record.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lxtask_common::constants::TASK_HANDLE_VERSION;
use lxtask_common::error::{LxtaskError, Result};
use lxtask_common::spec::TaskSpec;
use lxtask_common::types::TaskId;
use serde::{Deserialize, Serialize};

/// Persistent record of a task handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTaskState {
    /// Name of the backing container. Empty in version 0 records.
    #[serde(default)]
    pub container_name: String,
    /// Specification the task was started from.
    pub task_spec: TaskSpec,
    /// When the task was started.
    pub started_at: DateTime<Utc>,
    /// Record layout version; 0 marks records written before versioning.
    #[serde(default)]
    pub schema_version: u32,
}

impl PersistedTaskState {
    /// Creates a record at the current layout version.
    #[must_use]
    pub fn new(container_name: String, task_spec: TaskSpec, started_at: DateTime<Utc>) -> Self {
        Self {
            container_name,
            task_spec,
            started_at,
            schema_version: TASK_HANDLE_VERSION,
        }
    }

    /// Returns the task this record belongs to.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_spec.id
    }

    /// Encodes the record as an opaque blob.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decodes a record produced by [`Self::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is not a valid record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Returns the state file path of `id` inside `state_dir`.
///
/// The ID is percent-encoded so IDs containing `/` or `..` map to a single
/// file directly inside `state_dir`.
#[must_use]
pub fn state_path(state_dir: &Path, id: &TaskId) -> PathBuf {
    state_dir.join(format!("{}.json", file_stem(id)))
}

/// Encodes every byte outside `[A-Za-z0-9_-]` as `%XX`.
fn file_stem(id: &TaskId) -> String {
    let mut stem = String::with_capacity(id.as_str().len());
    for b in id.as_str().bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            stem.push(char::from(b));
        } else {
            stem.push_str(&format!("%{b:02X}"));
        }
    }
    stem
}

/// Persists a record atomically.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn save_state(state_dir: &Path, state: &PersistedTaskState) -> Result<()> {
    std::fs::create_dir_all(state_dir).map_err(|e| LxtaskError::Io {
        path: state_dir.to_path_buf(),
        source: e,
    })?;
    let path = state_path(state_dir, state.task_id());
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, state.to_bytes()?).map_err(|e| LxtaskError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp, &path).map_err(|e| LxtaskError::Io { path, source: e })?;
    tracing::debug!(task_id = %state.task_id(), "task state saved");
    Ok(())
}

/// Loads one record.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_state(path: &Path) -> Result<PersistedTaskState> {
    let bytes = std::fs::read(path).map_err(|e| LxtaskError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    PersistedTaskState::from_bytes(&bytes)
}

/// Loads every record in `state_dir`.
///
/// A missing directory yields no records. Unreadable files are logged and
/// skipped so one corrupt record does not block recovery of the others.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be listed.
pub fn load_all(state_dir: &Path) -> Result<Vec<PersistedTaskState>> {
    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(LxtaskError::Io {
                path: state_dir.to_path_buf(),
                source: e,
            });
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut states = Vec::with_capacity(paths.len());
    for path in paths {
        match load_state(&path) {
            Ok(state) => states.push(state),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping task state"),
        }
    }
    Ok(states)
}

/// Removes the record of `id`; a missing record is not an error.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be removed.
pub fn remove_state(state_dir: &Path, id: &TaskId) -> Result<()> {
    let path = state_path(state_dir, id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LxtaskError::Io { path, source: e }),
    }
}
