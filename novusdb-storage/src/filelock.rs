//! Process-exclusive advisory lock on `<path>.lock`, held for the Pager's
//! lifetime so a second process opening the same database file fails fast
//! instead of corrupting it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires an OS-level exclusive lock on `<db_path>.lock`, creating the
    /// lock file if needed. Fails immediately (never blocks) with
    /// `Error::LockHeld` if another process already holds it.
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let path = lock_path(db_path);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::LockHeld(format!("database file is locked: {}", path.display()))
        })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.ndb");
        let _guard = FileLock::acquire(&path).unwrap();
        let err = FileLock::acquire(&path).unwrap_err();
        assert!(matches!(err, Error::LockHeld(_)));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.ndb");
        {
            let _guard = FileLock::acquire(&path).unwrap();
        }
        let _guard2 = FileLock::acquire(&path).unwrap();
    }
}
