//! Bounded exponential-backoff supervision.
//!
//! Sessions never reconnect themselves and a discovery pass only retries its
//! own socket failures; this module is the generic wrapper callers put
//! around either. Once the attempts are exhausted the last error comes back
//! instead of retrying forever, and a cancelled backoff releases the caller
//! immediately.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::errors::Error;
use crate::events::EventBus;
use crate::registry::DeviceRegistry;
use crate::session::ControlSession;

type Result<T> = std::result::Result<T, Error>;

/// Backoff schedule: `base_delay` doubling per attempt, capped at
/// `max_delay`, for at most `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based failed attempt.
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or the token cancels
/// a pending backoff. The closure receives the zero-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.delay_for(attempt - 1);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                debug!("attempt {} failed: {err}", attempt + 1);
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or(Error::Cancelled))
}

/// Open a control session under the retry policy.
pub async fn connect_with_retry(
    addr: SocketAddr,
    registry: DeviceRegistry,
    events: EventBus,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<ControlSession> {
    with_retry(policy, cancel, |_| {
        ControlSession::connect(addr, registry.clone(), events.clone())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = quick_policy(6);
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = with_retry(&quick_policy(5), &cancel, |attempt| {
            calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt < 2 {
                    Err(Error::ResponseTimeout)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let cancel = CancellationToken::new();
        let result: Result<()> = with_retry(&quick_policy(3), &cancel, |_| async {
            Err(Error::ConnectionLost)
        })
        .await;
        assert_eq!(result.unwrap_err(), Error::ConnectionLost);
    }

    #[tokio::test]
    async fn test_cancelled_backoff_releases_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = with_retry(
            &RetryPolicy {
                base_delay: Duration::from_secs(3600),
                ..RetryPolicy::default()
            },
            &cancel,
            |_| async { Err(Error::ConnectionLost) },
        )
        .await;
        assert_eq!(result.unwrap_err(), Error::Cancelled);
    }
}
