//! Lock manager.
//!
//! Three cooperating mechanisms, all file-backed so independent processes can
//! coordinate without a shared server:
//! - [`LeaseManager`]: named, owned, TTL-bounded leases
//! - [`RunLock`]: per-run exclusivity for the process driving a run
//! - [`SubsystemLocks`]: batched subsystem leases in a fixed canonical order

pub mod lease;
pub mod run_lock;
pub mod subsystem;

pub use lease::{Lease, LeaseConfig, LeaseManager, Owner, ReleaseOutcome};
pub use run_lock::RunLock;
pub use subsystem::{Subsystem, SubsystemLocks, canonical_order};

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Blocking exclusive `flock` on a guard file, released on drop.
///
/// Held only for the few filesystem operations of a read-modify-write.
pub(crate) struct FileGuard {
    file: File,
}

impl FileGuard {
    pub(crate) fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Write `content` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}
