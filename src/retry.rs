use super::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::runner::CommandError;

/// Delay between two attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failed attempt, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn delay(&self, failed_attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(failed_attempts.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Bounded retry policy for flaky external calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(5),
            },
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy's attempts are used up.
///
/// The delay between attempts is interrupted by `cancel`, in which case the
/// last error is returned without a further attempt.
///
/// # Arguments
/// * `policy` - Attempt count and backoff
/// * `cancel` - Caller's cancellation token
/// * `is_retryable` - Classifies an attempt's error
/// * `operation` - Produces a fresh attempt on every call
pub async fn retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: R,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&eyre::Report) -> bool,
{
    let mut attempt = 1;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= policy.max_attempts.max(1) || !is_retryable(&err) {
            return Err(err);
        }

        let delay = policy.backoff.delay(attempt);
        debug!("Attempt {} failed, retrying in {:?}: {:#}", attempt, delay, err);
        tokio::select! {
            _ = cancel.cancelled() => return Err(err),
            _ = sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Recognises command failures caused by an unreachable or flapping API
/// server rather than by the request itself.
pub fn is_transient_network_error(err: &eyre::Report) -> bool {
    const MARKERS: [&str; 6] = [
        "connection refused",
        "connection reset by peer",
        "i/o timeout",
        "TLS handshake timeout",
        "unexpected EOF",
        "the server is currently unable to handle the request",
    ];
    match err.downcast_ref::<CommandError>() {
        Some(CommandError::Failed { stderr, .. }) => MARKERS.iter().any(|m| stderr.contains(m)),
        _ => false,
    }
}
