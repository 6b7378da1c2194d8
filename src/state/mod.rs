//! Persistence of the last snapshot and the idempotency ledger.
//!
//! Both are committed together as a single state file, so a restart
//! resumes diffing from the last fully delivered snapshot and never
//! re-sends what the ledger already covers. Events still held by the
//! debouncer travel with them, since the snapshot that produced them has
//! already been accepted.

mod file;
mod lock;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

pub use file::{FileStateStore, STATE_FILE_VERSION};
pub use lock::StateLock;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::detect::Event;
use crate::netmap::Snapshot;
use crate::notify::IdempotencyRecord;

/// Everything carried from one cycle to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    /// Last accepted snapshot; `None` before the first successful cycle.
    pub snapshot: Option<Snapshot>,
    /// Live idempotency records.
    pub ledger: Vec<IdempotencyRecord>,
    /// Detected events not yet released by the debouncer.
    pub pending: Vec<Event>,
}

impl PersistedState {
    /// Creates a state holding `snapshot` and `ledger`.
    #[must_use]
    pub const fn new(snapshot: Option<Snapshot>, ledger: Vec<IdempotencyRecord>) -> Self {
        Self {
            snapshot,
            ledger,
            pending: Vec::new(),
        }
    }

    /// Sets the held events.
    #[must_use]
    pub fn with_pending(mut self, pending: Vec<Event>) -> Self {
        self.pending = pending;
        self
    }
}

/// Result of loading state from persistent storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResult {
    /// A state file was read and validated.
    Loaded(PersistedState),

    /// No state file exists (first run or explicitly deleted).
    NotFound,
}

impl LoadResult {
    /// Returns the loaded state, or an empty one for `NotFound`.
    #[must_use]
    pub fn into_state(self) -> PersistedState {
        match self {
            Self::Loaded(state) => state,
            Self::NotFound => PersistedState::default(),
        }
    }

    /// Returns `true` if state was successfully loaded.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

/// Errors that can occur during state persistence operations.
///
/// Every load-side variant is fatal: a state file that exists but
/// cannot be trusted is never silently replaced.
#[derive(Debug, Error)]
pub enum StateError {
    /// Failed to read the state file.
    #[error("Failed to read state file {}: {source}", .path.display())]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The state file is not valid JSON for the expected layout.
    #[error("State file {} is corrupt: {source}", .path.display())]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The state file was written by an incompatible format version.
    #[error("State file {} has version {found}, expected {expected}", .path.display())]
    Version {
        /// File that was read.
        path: PathBuf,
        /// Version in the file.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// Failed to write the state file.
    #[error("Failed to write state file: {0}")]
    Write(#[source] io::Error),

    /// Failed to serialize state to JSON.
    #[error("Failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The background write task did not finish.
    #[error("State write task failed: {0}")]
    Task(String),

    /// Another process holds the state lock.
    #[error("State file {} is locked by another sentinel instance", .0.display())]
    Locked(PathBuf),

    /// The lock file could not be opened or locked.
    #[error("Failed to lock state file {}: {source}", .path.display())]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Abstraction for persisting state between cycles and program runs.
///
/// Implementations must replace the stored state atomically: a crash in
/// the middle of [`commit`](Self::commit) leaves either the old or the
/// new state, never a mix.
///
/// # Testing
///
/// Use [`mock::MockStateStore`] in tests to avoid filesystem dependencies.
pub trait StateStore: Send + Sync {
    /// Loads previously committed state.
    ///
    /// # Errors
    ///
    /// Returns an error if state exists but cannot be read or validated.
    fn load(&self) -> Result<LoadResult, StateError>;

    /// Replaces the stored state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn commit(
        &self,
        state: &PersistedState,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;
}
