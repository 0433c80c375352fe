//! Advisory lock serializing update runs against one database directory.
//!
//! The lock is a plain file held with an exclusive `flock`-style advisory
//! lock, so it coordinates separate process invocations, not just tasks in
//! this process. Nothing is ever written to the file; only the advisory hold
//! matters.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::UpdateError;

/// An exclusive hold on a database directory's lock file.
///
/// The hold lasts for the guard's lifetime and is released on drop, on every
/// exit path including panics. The lock file itself is left in place.
#[derive(Debug)]
pub struct DirectoryLock {
    file: std::fs::File,
    path: PathBuf,
}

impl DirectoryLock {
    /// Acquires the lock, failing fast if another run already holds it.
    ///
    /// Parent directories of the lock path are created if needed.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Io`] if the lock file cannot be created and
    /// [`UpdateError::Lock`] if the advisory lock is already held.
    pub fn acquire(path: &Path) -> Result<Self, UpdateError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| UpdateError::io(parent, e))?;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| UpdateError::io(path, e))?;

        file.try_lock_exclusive()
            .map_err(|e| UpdateError::lock(path, e))?;

        debug!(path = %path.display(), "acquired database directory lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        // Closing the file would release the lock anyway; unlock explicitly
        // so the release is not left to descriptor teardown order.
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "released database directory lock");
    }
}
