use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// The single token shared by every operation that mutates the server or world directories.
///
/// Updates, backups and server restarts each hold it for their whole filesystem-touching window,
/// so at most one of them is active at any instant.
#[derive(Clone, Default)]
pub struct WorkLock {
    inner: Arc<Mutex<()>>,
}

pub type WorkGuard = OwnedMutexGuard<()>;

impl WorkLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the token; gives up with `None` once `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<WorkGuard> {
        tokio::select! {
            guard = self.inner.clone().lock_owned() => Some(guard),
            _ = cancel.cancelled() => None,
        }
    }

    pub fn try_acquire(&self) -> Option<WorkGuard> {
        self.inner.clone().try_lock_owned().ok()
    }
}
