use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::state::LifecycleState;

/// Errors surfaced by the lifecycle components.
///
/// Everything except [`LifecycleError::Fatal`] is recoverable: the orchestrator logs it at the
/// task boundary and keeps the server running.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("no world data found at {}", .0.display())]
    NoWorldData(PathBuf),

    #[error("{command} exited unsuccessfully: {status}")]
    SubprocessFailure { command: String, status: String },

    #[error("failed to evict backup {}: {source}", path.display())]
    RetentionIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl LifecycleError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LifecycleError::Fatal(_))
    }
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;
