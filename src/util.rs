//! Shared async helpers.

use std::future::Future;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Run blocking work (terminal reads, file I/O) off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Await `fut`, failing with `Error::Timeout` once `duration` elapses.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(duration, fut)
        .await
        .map_err(|_| Error::Timeout(duration))?
}

/// Like `with_timeout`, but `None` waits indefinitely.
pub async fn with_optional_timeout<F, T>(duration: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match duration {
        Some(duration) => with_timeout(duration, fut).await,
        None => fut.await,
    }
}

/// Drive `fut` to completion on a fresh multi-threaded runtime, then shut
/// the runtime down without waiting on blocking threads.
///
/// A terminal read abandoned by a cancelled or timed-out decision stays
/// parked in `read_line`; dropping the runtime normally would wait for it.
pub fn block_on_detached<F: Future>(fut: F) -> Result<F::Output> {
    let rt = tokio::runtime::Runtime::new()?;
    let output = rt.block_on(fut);
    rt.shutdown_background();
    Ok(output)
}
