//! Single-instance guard for a state file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::StateError;

/// Exclusive lock on `<state path>.lock`, held until dropped.
///
/// Two processes sharing a state path would overwrite each other's
/// snapshot and ledger, so the second one fails at startup instead.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
    path: PathBuf,
}

impl StateLock {
    /// Takes the lock for `state_path`, creating the lock file and its
    /// parent directory if needed. Never blocks.
    ///
    /// # Errors
    ///
    /// - [`StateError::Locked`] if another process holds the lock
    /// - [`StateError::Lock`] if the lock file cannot be opened or locked
    pub fn acquire(state_path: &Path) -> Result<Self, StateError> {
        let path = PathBuf::from(format!("{}.lock", state_path.display()));
        let lock_error = |source| StateError::Lock {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(lock_error)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_error)?;

        match try_lock(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(StateError::Locked(state_path.to_path_buf()));
            }
            Err(e) => return Err(lock_error(e)),
        }

        tracing::debug!(path = %path.display(), "Acquired state lock");
        Ok(Self { _file: file, path })
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn try_lock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }

    let error = io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "state file is locked by another process",
        ));
    }
    Err(error)
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> io::Result<()> {
    tracing::warn!("File locking is not supported on this platform, continuing without a lock");
    Ok(())
}
