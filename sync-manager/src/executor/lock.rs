//! One run per service and environment.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::config::Environment;
use crate::utils::SyncError;

/// Exclusive advisory lock on `{scratch}/{service}-{env}.lock`, released on
/// drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl RunLock {
    pub fn acquire(scratch_root: &Path, service: &str, env: Environment) -> Result<Self, SyncError> {
        std::fs::create_dir_all(scratch_root)?;
        let path = scratch_root.join(format!("{}-{}.lock", service, env));

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(SyncError::LockBusy { path });
            }
            Err((_, errno)) => return Err(SyncError::Io(errno.into())),
        };

        // Owner pid, for operators inspecting a stuck lock
        lock.set_len(0)?;
        (&*lock).write_all(format!("{}\n", std::process::id()).as_bytes())?;

        debug!(lock = %path.display(), "Run lock acquired");
        Ok(Self { path, _file: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_is_busy() {
        let dir = TempDir::new().unwrap();
        let held = RunLock::acquire(dir.path(), "svc", Environment::Prod).unwrap();
        assert!(held.path().ends_with("svc-prod.lock"));

        let err = RunLock::acquire(dir.path(), "svc", Environment::Prod).unwrap_err();
        assert!(matches!(err, SyncError::LockBusy { .. }));

        // Other environments are independent
        assert!(RunLock::acquire(dir.path(), "svc", Environment::Dev).is_ok());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        drop(RunLock::acquire(dir.path(), "svc", Environment::Dev).unwrap());
        assert!(RunLock::acquire(dir.path(), "svc", Environment::Dev).is_ok());
    }
}
