use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio_util::sync::CancellationToken;

use crate::error::{LifecycleError, Result};

/// Lock file kept in the backup directory. Hidden, so listing and retention never see it.
pub const LOCK_FILE: &str = ".gsm-backup.lock";

const RETRY: Duration = Duration::from_millis(50);

/// Exclusive `flock` on the backup directory, shared by every process that writes archives
/// there. Released on drop.
pub struct DirLock {
    _lock: Flock<File>,
}

impl DirLock {
    /// `Ok(None)` when another holder has it.
    pub fn try_acquire(dir: &Path) -> Result<Option<DirLock>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(dir.join(LOCK_FILE))?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(DirLock { _lock: lock })),
            Err((_, e)) if e == Errno::EWOULDBLOCK => Ok(None),
            Err((_, e)) => Err(LifecycleError::Io(e.into())),
        }
    }

    /// Block until the lock is ours, or `Ok(None)` once `cancel` fires. Blocking.
    pub fn acquire(dir: &Path, cancel: &CancellationToken) -> Result<Option<DirLock>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(lock) = Self::try_acquire(dir)? {
                return Ok(Some(lock));
            }
            thread::sleep(RETRY);
        }
    }
}
