//! Bounded polling shared by the health-convergence loop and the kubernetes
//! readiness wait.

use super::Result;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Timing of a poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Hard limit for the whole wait
    pub timeout: Duration,
    /// Pause between two checks
    pub interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Ready,
    NotReady,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timeout waiting for {what} after {timeout:?}")]
    TimedOut { what: String, timeout: Duration },
    #[error("wait for {what} was cancelled")]
    Cancelled { what: String },
}

/// Calls `check` until it reports [`Check::Ready`].
///
/// Errors returned by `check` abort the wait immediately and are propagated
/// unchanged. The deadline and `cancel` are observed while a check is in
/// flight as well as between checks, so the call returns at most one check
/// duration after either fires.
///
/// # Arguments
/// * `what` - Description of the awaited condition, used in errors
/// * `options` - Timeout and poll interval
/// * `cancel` - Caller's cancellation token
/// * `check` - Produces a fresh observation on every call
///
/// # Returns
/// * `Result<()>` - Success, the check's error, or a [`WaitError`]
pub async fn wait_until<F, Fut>(
    what: &str,
    options: &WaitOptions,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Check>>,
{
    let deadline = Instant::now() + options.timeout;

    let poll = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if check().await? == Check::Ready {
                debug!("{} ready after {} checks", what, attempt);
                return Ok(());
            }
            sleep(options.interval).await;
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WaitError::Cancelled { what: what.to_string() }.into()),
        _ = sleep_until(deadline) => Err(WaitError::TimedOut {
            what: what.to_string(),
            timeout: options.timeout,
        }
        .into()),
        result = poll => result,
    }
}
