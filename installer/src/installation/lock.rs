use crate::installation::error::InstallError;
use log::{debug, warn};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = ".devel-install.lock";

/// Exclusive claim on an install root for the lifetime of one run. Removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Create `<root>/.devel-install.lock`. Fails immediately if another run holds it.
    pub fn acquire(root: &Path, run_id: &str) -> Result<Self, InstallError> {
        let path = root.join(LOCK_FILE_NAME);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "pid={}\nrun_id={}", std::process::id(), run_id) {
                    debug!(
                        "[PHASE: install] [STEP: lock] Could not write lock details to {:?}: {}",
                        path, e
                    );
                }
                debug!("[PHASE: install] [STEP: lock] Acquired {:?}", path);
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(InstallError::Precondition(format!(
                    "Another install run holds the lock {:?}; remove it if no run is active",
                    path
                )))
            }
            Err(e) => Err(InstallError::io(
                format!("Failed to create lock file {:?}", path),
                e,
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(
                "[PHASE: install] [STEP: lock] Failed to release {:?}: {}",
                self.path, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunLock::acquire(dir.path(), "run-1").unwrap();
        assert!(first.path().exists());

        let err = RunLock::acquire(dir.path(), "run-2").unwrap_err();
        assert!(matches!(err, InstallError::Precondition(ref m) if m.contains(LOCK_FILE_NAME)));

        drop(first);
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
        let _again = RunLock::acquire(dir.path(), "run-3").unwrap();
    }

    #[test]
    fn lock_records_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(dir.path(), "abc-123").unwrap();
        let body = fs::read_to_string(lock.path()).unwrap();
        assert!(body.contains("run_id=abc-123"));
    }

    #[test]
    fn missing_root_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunLock::acquire(&dir.path().join("absent"), "r").unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
