//! Per-run exclusivity.
//!
//! The process driving a run holds an exclusive `flock` on
//! `runs/<run_id>/run.lock` for its lifetime. A second driver fails
//! immediately instead of queueing. The OS drops the lock if the holder dies,
//! so a crashed driver never leaves the run wedged.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::LockError;

pub const RUN_LOCK_FILE: &str = "run.lock";

pub fn run_lock_path(root: &Path, run_id: &str) -> PathBuf {
    root.join("runs").join(run_id).join(RUN_LOCK_FILE)
}

/// Exclusive claim over one run, released on drop.
#[derive(Debug)]
pub struct RunLock {
    run_id: String,
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// Claim `run_id` for this process. Never blocks.
    pub fn acquire(root: &Path, run_id: &str, holder: &str) -> Result<Self, LockError> {
        let path = run_lock_path(root, run_id);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(LockError::RunLocked {
                    run_id: run_id.to_string(),
                    path,
                });
            }
            Err(source) => return Err(LockError::Io { path, source }),
        }

        // Holder identity is informational only; the flock is authoritative.
        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        file.write_all(holder.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        tracing::info!(run_id, holder, "run lock acquired");
        Ok(Self {
            run_id: run_id.to_string(),
            path,
            file,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last recorded holder of a run lock, if any was ever written.
    pub fn last_holder(root: &Path, run_id: &str) -> Option<String> {
        let mut content = String::new();
        File::open(run_lock_path(root, run_id))
            .ok()?
            .read_to_string(&mut content)
            .ok()?;
        let holder = content.trim();
        (!holder.is_empty()).then(|| holder.to_string())
    }

    /// Whether some process currently holds the run lock.
    pub fn is_locked(root: &Path, run_id: &str) -> bool {
        let Ok(file) = File::open(run_lock_path(root, run_id)) else {
            return false;
        };
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(run_id = %self.run_id, "run lock released");
    }
}
