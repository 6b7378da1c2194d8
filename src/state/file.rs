//! File-based state persistence implementation.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::detect::Event;
use crate::netmap::Snapshot;
use crate::notify::IdempotencyRecord;

use super::{LoadResult, PersistedState, StateError, StateStore};

/// Current state file format version.
///
/// Files with any other version are rejected at load.
pub const STATE_FILE_VERSION: u32 = 1;

/// On-disk state file format.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    snapshot: Option<Snapshot>,
    #[serde(default)]
    ledger: Vec<IdempotencyRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pending: Vec<Event>,
}

/// Only the version, so a future layout is reported as a version
/// mismatch rather than a parse error.
#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

/// File-based implementation of [`StateStore`].
///
/// Stores the snapshot and ledger as one JSON document:
///
/// ```json
/// {"version": 1, "snapshot": {...} | null, "ledger": [...]}
/// ```
///
/// A `pending` array of held events is added when the debouncer holds any.
///
/// # Atomic Writes
///
/// 1. Write to `{path}.tmp`
/// 2. `fsync` the temp file
/// 3. Rename `{path}.tmp` to `{path}`
/// 4. `fsync` the parent directory (unix) so the rename survives power loss
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Creates a new file-based state store at the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path to the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(path: &Path) -> PathBuf {
        // state.json -> state.json.tmp, not state.tmp
        PathBuf::from(format!("{}.tmp", path.display()))
    }

    fn commit_blocking(path: &Path, content: &[u8]) -> Result<(), StateError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(StateError::Write)?;
        }

        let temp_path = Self::temp_path(path);
        let mut file = File::create(&temp_path).map_err(StateError::Write)?;
        file.write_all(content).map_err(StateError::Write)?;
        file.sync_all().map_err(StateError::Write)?;
        drop(file);

        fs::rename(&temp_path, path).map_err(StateError::Write)?;
        Self::sync_parent(path)
    }

    #[cfg(unix)]
    fn sync_parent(path: &Path) -> Result<(), StateError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(StateError::Write)
    }

    #[cfg(not(unix))]
    #[allow(clippy::unnecessary_wraps)]
    fn sync_parent(_path: &Path) -> Result<(), StateError> {
        Ok(())
    }

    fn parse(&self, content: &str) -> Result<PersistedState, StateError> {
        let parse_error = |source| StateError::Parse {
            path: self.path.clone(),
            source,
        };

        let header: VersionHeader = serde_json::from_str(content).map_err(parse_error)?;
        if header.version != STATE_FILE_VERSION {
            return Err(StateError::Version {
                path: self.path.clone(),
                found: header.version,
                expected: STATE_FILE_VERSION,
            });
        }

        let file: StateFile = serde_json::from_str(content).map_err(parse_error)?;
        Ok(PersistedState::new(file.snapshot, file.ledger).with_pending(file.pending))
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<LoadResult, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LoadResult::NotFound),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let state = self.parse(&content)?;
        tracing::debug!(
            path = %self.path.display(),
            generation = state.snapshot.as_ref().map(|s| s.generation),
            ledger = state.ledger.len(),
            pending = state.pending.len(),
            "Loaded state"
        );
        Ok(LoadResult::Loaded(state))
    }

    async fn commit(&self, state: &PersistedState) -> Result<(), StateError> {
        let file = StateFile {
            version: STATE_FILE_VERSION,
            snapshot: state.snapshot.clone(),
            ledger: state.ledger.clone(),
            pending: state.pending.clone(),
        };
        let content = serde_json::to_vec_pretty(&file).map_err(StateError::Serialize)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || Self::commit_blocking(&path, &content))
            .await
            .map_err(|e| StateError::Task(e.to_string()))?
    }
}
