use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::timeout;

use crate::idle::A2sQuery;

/// Reads the current readiness indicator of the server.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Called right before the server is spawned so stale indicators from a previous run are
    /// not mistaken for the new one.
    async fn arm(&self) {}

    async fn is_ready(&self) -> Result<bool>;
}

/// Ready once `marker` shows up in the server log after the last [`ReadinessProbe::arm`].
pub struct LogMarkerProbe {
    log_file: PathBuf,
    marker: String,
    offset: AtomicU64,
}

impl LogMarkerProbe {
    pub fn new(log_file: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            log_file: log_file.into(),
            marker: marker.into(),
            offset: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ReadinessProbe for LogMarkerProbe {
    async fn arm(&self) {
        let len = tokio::fs::metadata(&self.log_file)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        self.offset.store(len, Ordering::SeqCst);
    }

    async fn is_ready(&self) -> Result<bool> {
        let mut file = match File::open(&self.log_file).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to open server log {}", self.log_file.display())
                });
            }
        };
        let mut offset = self.offset.load(Ordering::SeqCst);
        // The log was truncated or rotated since arming; scan it from the start.
        if file.metadata().await?.len() < offset {
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).contains(&self.marker))
    }
}

/// Ready once the server answers its A2S query port.
pub struct QueryProbe {
    query: A2sQuery,
    timeout: Duration,
}

impl QueryProbe {
    pub fn new(query: A2sQuery, timeout: Duration) -> Self {
        Self { query, timeout }
    }
}

#[async_trait]
impl ReadinessProbe for QueryProbe {
    async fn is_ready(&self) -> Result<bool> {
        Ok(matches!(
            timeout(self.timeout, self.query.info()).await,
            Ok(Ok(_))
        ))
    }
}
