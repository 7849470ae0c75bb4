use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Poll `check` every `interval` until it reports `true` or `timeout` elapses.
///
/// The first check happens immediately. Returns whether the condition was observed.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}
