use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive advisory lock on an engine directory. A second process opening
/// the same directory fails immediately instead of corrupting the store.
/// The lock is released when the value is dropped; the lock file itself is
/// left behind to avoid unlink races.
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Locks `<dir>/LOCK`, writing the process id into it for debugging.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<DirLock> {
        let path = dir.as_ref().join("LOCK");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Self::try_lock(&file)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(DirLock { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_writes_pid() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let lock = DirLock::acquire(dir.path()).expect("lock failed");
        let content = std::fs::read_to_string(lock.path()).expect("read failed");
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_second_lock_fails_until_released() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let lock = DirLock::acquire(dir.path()).expect("lock failed");
        assert!(DirLock::acquire(dir.path()).is_err());
        drop(lock);
        DirLock::acquire(dir.path()).expect("relock failed");
    }
}
