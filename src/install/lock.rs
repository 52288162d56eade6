// src/install/lock.rs

//! Advisory file locks for the install tree
//!
//! - **Prefix lock**: `<install_root>/.strata/prefix.lock`, held exclusively
//!   for a whole installer run. Concurrent `strata install` invocations
//!   serialize on it.
//! - **Database lock**: `<db>.lock`, taken for each batch of database
//!   writes with a short bounded wait so the installer loop never stalls
//!   behind another process.
//!
//! Both are `flock(LOCK_EX)` locks that are released when dropped.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?)
}

/// Exclusive lock over an install root
pub struct PrefixLock {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl PrefixLock {
    pub fn lock_path(install_root: &Path) -> PathBuf {
        install_root.join(".strata").join("prefix.lock")
    }

    /// Acquire the lock, blocking until available
    pub fn acquire(install_root: &Path) -> Result<Self> {
        let path = Self::lock_path(install_root);
        let file = open_lock_file(&path)?;
        file.lock_exclusive()
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("failed to lock {}: {}", path.display(), e))))?;
        debug!("Acquired prefix lock at {:?}", path);
        Ok(Self { file, path })
    }

    /// Try to acquire the lock without blocking
    ///
    /// Returns `Ok(None)` if another process holds it.
    pub fn try_acquire(install_root: &Path) -> Result<Option<Self>> {
        let path = Self::lock_path(install_root);
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired prefix lock at {:?}", path);
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Prefix lock already held at {:?}", path);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PrefixLock {
    fn drop(&mut self) {
        debug!("Released prefix lock at {:?}", self.path);
    }
}

/// Write lock guarding the installed-package database
pub struct DatabaseLock {
    path: PathBuf,
}

/// Held database write lock
pub struct WriteGuard {
    #[allow(dead_code)]
    file: File,
}

impl DatabaseLock {
    /// Lock living beside the database file
    pub fn for_database(db_path: &Path) -> Self {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        Self {
            path: PathBuf::from(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the write lock for at most `timeout`
    ///
    /// Returns `Ok(None)` when the lock stayed busy.
    pub fn try_write(&self, timeout: Duration) -> Result<Option<WriteGuard>> {
        let file = open_lock_file(&self.path)?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Some(WriteGuard { file })),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prefix_lock_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let lock = PrefixLock::acquire(temp_dir.path()).unwrap();
        assert!(lock.path().exists());
        assert!(PrefixLock::try_acquire(temp_dir.path()).unwrap().is_none());

        drop(lock);
        assert!(PrefixLock::try_acquire(temp_dir.path()).unwrap().is_some());
    }

    #[test]
    fn test_database_lock_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let lock = DatabaseLock::for_database(&temp_dir.path().join("db.sqlite"));
        assert!(lock.path().ends_with("db.sqlite.lock"));

        let held = lock.try_write(Duration::from_millis(1)).unwrap();
        assert!(held.is_some());
        let start = Instant::now();
        assert!(lock.try_write(Duration::from_millis(20)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));

        drop(held);
        assert!(lock.try_write(Duration::from_millis(1)).unwrap().is_some());
    }
}
