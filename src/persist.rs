//! Disk I/O helpers: optional read, atomic write, and lock files.
//!
//! The rename-over approach is close to atomic on most platforms. On NTFS
//! (Windows) it's reliable; on FAT32 or network shares there are no hard
//! guarantees. Readers never see a half-written document either way: they
//! get the old file or the new one.

use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Reads the file at `path`. `Ok(None)` if it doesn't exist.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::backend(path.display().to_string(), e)),
    }
}

/// Write `bytes` to `<path>.tmp`, fsync it, then rename over `path`. This
/// avoids leaving a half-written file if the process crashes mid-write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let io_err = |e: std::io::Error| Error::backend(path.display().to_string(), e);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = sibling(path, "tmp");
    let mut file = File::create(&tmp).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

/// `<path>.<suffix>`, keeping the original extension: `doc.json` becomes
/// `doc.json.lock`.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

const POLL_MIN: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(25);

/// Advisory lock held as an exclusively-created lock file.
///
/// Creation with `create_new` is atomic on local filesystems, so exactly one
/// holder wins. The file is removed on drop. A process killed while holding
/// the lock leaves the file behind; it has to be deleted by hand.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Poll for the lock file at `path` until `timeout` runs out.
    ///
    /// Returns `Ok(None)` on timeout so the caller can attach its own
    /// resource name to the error.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Option<Self>> {
        let deadline = Instant::now() + timeout;
        let mut pause = POLL_MIN;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // Holder pid, for whoever has to clean up a stale lock.
                    if let Err(e) = write!(file, "{}", std::process::id()) {
                        tracing::debug!(lock = %path.display(), error = %e, "could not record lock holder pid");
                    }
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        fs::create_dir_all(parent)
                            .map_err(|e| Error::backend(path.display().to_string(), e))?;
                    }
                }
                Err(e) => return Err(Error::backend(path.display().to_string(), e)),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(pause.min(deadline - now));
            pause = (pause * 2).min(POLL_MAX);
        }
    }

    /// Where the lock file lives.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_keeps_extension() {
        let p = Path::new("/data/job/doc.json");
        assert_eq!(sibling(p, "lock"), PathBuf::from("/data/job/doc.json.lock"));
        assert_eq!(sibling(p, "tmp"), PathBuf::from("/data/job/doc.json.tmp"));
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        atomic_write(&path, b"[1]").unwrap();
        assert_eq!(read_optional(&path).unwrap(), Some(b"[1]".to_vec()));
        assert!(!sibling(&path, "tmp").exists());
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_optional(&dir.path().join("absent.json")).unwrap(), None);
    }

    #[test]
    fn second_lock_times_out_until_first_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json.lock");
        let first = FileLock::acquire(&path, Duration::from_millis(50))
            .unwrap()
            .unwrap();
        assert!(FileLock::acquire(&path, Duration::from_millis(20))
            .unwrap()
            .is_none());
        drop(first);
        assert!(!path.exists());
        assert!(FileLock::acquire(&path, Duration::from_millis(20))
            .unwrap()
            .is_some());
    }
}
