//! Single-writer lock on a store directory.
//!
//! The lock lives in `<store>/.lock`. While held, the file names the owning
//! process, so a second run refused with [`ErrorKind::WouldBlock`] can say
//! who is writing. The lock is released when the [`StoreLock`] is dropped,
//! even if the run aborts.

use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

const LOCK_FILE: &str = ".lock";

#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Locks the store directory `dir` without blocking.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` when another run holds the lock
    /// - any I/O error creating or writing the lock file
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !flock_exclusive(&file)? {
            let holder = Self::holder(dir).unwrap_or_else(|| "unknown owner".to_string());
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("store is being written by {holder}"),
            ));
        }

        let mut lock = Self { file, path };
        lock.stamp()?;
        Ok(lock)
    }

    /// Owner line of the lock file of `dir`, if any.
    #[must_use]
    pub fn holder(dir: &Path) -> Option<String> {
        let text = fs::read_to_string(dir.join(LOCK_FILE)).ok()?;
        let line = text.lines().next()?.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records this process as the owner.
    fn stamp(&mut self) -> IoResult<()> {
        self.file.set_len(0)?;
        writeln!(
            self.file,
            "pid {} since {}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )?;
        self.file.sync_data()
    }
}

/// `Ok(false)` when someone else holds the lock.
#[cfg(unix)]
fn flock_exclusive(file: &File) -> IoResult<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = IoError::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> IoResult<bool> {
    tracing::warn!("store locking is not supported on this platform; running unlocked");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_names_its_owner() {
        let dir = tempdir().unwrap();
        let lock = StoreLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());

        let holder = StoreLock::holder(dir.path()).unwrap();
        assert!(holder.starts_with(&format!("pid {}", std::process::id())));
    }

    #[test]
    fn test_lock_can_be_taken_again_after_drop() {
        let dir = tempdir().unwrap();
        drop(StoreLock::acquire(dir.path()).unwrap());
        assert!(StoreLock::acquire(dir.path()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_second_writer_is_refused() {
        let dir = tempdir().unwrap();
        let _lock = StoreLock::acquire(dir.path()).unwrap();

        let err = StoreLock::acquire(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert!(err.to_string().contains("pid"));
    }
}
