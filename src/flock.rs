//! Single-handle guard for a map file.
//!
//! The engine assumes exactly one handle per file: appends and metadata
//! publication are coordinated in process memory, not through the file.
//! An advisory lock on a sibling `<file>.lock` enforces that at open
//! time, so a second open fails fast instead of interleaving appends.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Held for the lifetime of an open map; the kernel releases the lock
/// when the descriptor closes, including on crash.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Take the exclusive lock guarding `map_path`, creating the sibling
    /// lock file when missing. Fails immediately when another handle
    /// already holds it.
    pub fn acquire(map_path: &Path) -> io::Result<Self> {
        let path = Self::lock_path(map_path);
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        acquire_exclusive(&file)?;

        // The lock lives in the kernel; the recorded pid is only there
        // for post-mortem inspection of a stale lock file.
        file.set_len(0)?;
        writeln!(file, "pid {}", std::process::id())?;

        Ok(Self { _file: file, path })
    }

    /// The sibling lock file guarding `map_path`.
    pub fn lock_path(map_path: &Path) -> PathBuf {
        let mut os = map_path.as_os_str().to_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn acquire_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(not(unix))]
fn acquire_exclusive(_file: &File) -> io::Result<()> {
    // No advisory locking on this platform; the engine still works, it
    // just cannot reject a concurrent second open.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;

    #[test]
    fn test_acquire_creates_sibling_lock_file() {
        let tmp = NamedTempFile::new().expect("Failed to create temp file");

        let lock = FileLock::acquire(tmp.path()).expect("Failed to acquire lock");
        assert_eq!(lock.path(), FileLock::lock_path(tmp.path()));

        let recorded = std::fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert_eq!(recorded.trim(), format!("pid {}", std::process::id()));
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let tmp = NamedTempFile::new().expect("Failed to create temp file");

        let _held = FileLock::acquire(tmp.path()).expect("Failed to acquire lock");
        assert!(FileLock::acquire(tmp.path()).is_err());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let tmp = NamedTempFile::new().expect("Failed to create temp file");

        drop(FileLock::acquire(tmp.path()).expect("Failed to acquire lock"));
        FileLock::acquire(tmp.path()).expect("Lock not released on drop");
    }
}
