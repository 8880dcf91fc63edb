//! Polling helpers for effects that happen on background tasks

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Default time allowed for a background effect to show up
pub const EVENTUAL_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wait until `condition` holds, polling every few milliseconds
///
/// # Example
///
/// ```rust,ignore
/// assert_eventually(EVENTUAL_TIMEOUT, || async {
///     server.registry().stats().await.members == 0
/// })
/// .await
/// .expect("member should be removed");
/// ```
pub async fn assert_eventually<F, Fut>(timeout: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if condition().await {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(format!("Condition not met within {:?}", timeout));
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Like [`assert_eventually`] for checks that need no awaiting
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> Result<(), String>
where
    F: FnMut() -> bool,
{
    assert_eventually(timeout, || {
        let done = check();
        async move { done }
    })
    .await
}
