//! PID lock file guarding against a second instance on the same host.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Default lock file location, relative to the working directory.
pub const DEFAULT_LOCK_PATH: &str = ".pid.lock";

/// An acquired lock file containing the current process id.
///
/// The file is removed on [`PidLock::release`] or when the guard is dropped.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    released: bool,
}

impl PidLock {
    /// Create the lock file with exclusive-create semantics.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => Error::LockHeld(path.display().to_string()),
                _ => Error::Io(e),
            })?;

        if let Err(e) = file.write_all(std::process::id().to_string().as_bytes()) {
            let _ = std::fs::remove_file(&path);
            return Err(Error::Io(e));
        }

        tracing::debug!(path = %path.display(), "lock file created");
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file; a missing file is not an error.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "lock file removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file"),
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release();
    }
}
