pub mod a2s;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{LifecycleError, Result};

pub use a2s::A2sQuery;

/// Something that can report how many players are connected right now.
#[async_trait]
pub trait IdleSource: Send + Sync {
    async fn player_count(&self) -> anyhow::Result<u32>;

    /// Short label used in log lines.
    fn describe(&self) -> String;
}

/// Answers "is anybody playing?" with a fresh query every time.
///
/// Any failure to obtain a count (timeout, unreachable server, malformed reply) is reported as
/// **not idle**: an unknown player count must never be mistaken for an empty server.
#[derive(Clone)]
pub struct IdleDetector {
    source: Arc<dyn IdleSource>,
    timeout: Duration,
}

impl IdleDetector {
    pub fn new(source: Arc<dyn IdleSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Raw check, surfacing why the answer could not be obtained.
    pub async fn check(&self) -> Result<bool> {
        let count = timeout(self.timeout, self.source.player_count())
            .await
            .map_err(|_| LifecycleError::Timeout {
                operation: "idle query",
                timeout: self.timeout,
            })?
            .map_err(|e| {
                LifecycleError::Io(std::io::Error::other(format!(
                    "{}: {e:#}",
                    self.source.describe()
                )))
            })?;
        debug!(source = %self.source.describe(), players = count, "queried player count");
        Ok(count == 0)
    }

    pub async fn is_idle(&self) -> bool {
        match self.check().await {
            Ok(idle) => idle,
            Err(e) => {
                warn!(
                    source = %self.source.describe(),
                    error = %e,
                    "idle check failed, treating server as busy"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct Fixed(anyhow::Result<u32>);

    #[async_trait]
    impl IdleSource for Fixed {
        async fn player_count(&self) -> anyhow::Result<u32> {
            match &self.0 {
                Ok(n) => Ok(*n),
                Err(e) => Err(anyhow!("{e}")),
            }
        }

        fn describe(&self) -> String {
            "fixed".to_string()
        }
    }

    struct Hang;

    #[async_trait]
    impl IdleSource for Hang {
        async fn player_count(&self) -> anyhow::Result<u32> {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "hang".to_string()
        }
    }

    fn detector(source: impl IdleSource + 'static) -> IdleDetector {
        IdleDetector::new(Arc::new(source), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_zero_players_is_idle() {
        assert!(detector(Fixed(Ok(0))).is_idle().await);
        assert!(!detector(Fixed(Ok(2))).is_idle().await);
    }

    #[tokio::test]
    async fn test_fails_closed() {
        let d = detector(Fixed(Err(anyhow!("connection refused"))));
        assert!(d.check().await.is_err());
        assert!(!d.is_idle().await);
    }

    #[tokio::test]
    async fn test_timeout_is_not_idle() {
        let d = detector(Hang);
        assert!(matches!(
            d.check().await,
            Err(LifecycleError::Timeout { .. })
        ));
        assert!(!d.is_idle().await);
    }
}
