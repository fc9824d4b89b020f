//! Deadline-bounded polling

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Poll `check` every `interval` until it yields a value or `timeout`
/// passes. The check always runs at least once.
pub async fn wait_for<T, F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        sleep(interval.min(deadline - now)).await;
    }
}
