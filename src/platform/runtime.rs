use std::future::Future;
use std::time::Duration;

/// Awaits `future`, giving up after `timeout` when one is configured.
///
/// Returns `None` when the deadline elapsed first.
pub async fn with_timeout<F>(timeout: Option<Duration>, future: F) -> Option<F::Output>
where
    F: Future,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}
