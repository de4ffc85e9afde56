//! Retry executor with bounded attempts, a start deadline and pluggable delays.
//!
//! Used by plugins for flaky remote calls and by the plan builder to wrap
//! provisioners that declare `max_retries`.

mod backoff;

pub use backoff::Backoff;

use crate::cancellation::CancellationToken;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Delay used between attempts when none is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Why a retried operation ultimately failed.
///
/// Every variant except [`RetryError::Exhausted`] carries the operation's own
/// error unchanged.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All permitted attempts failed.
    #[error("retry count exhausted after {tries} attempt(s). Last err: {last}")]
    Exhausted {
        /// Attempts made.
        tries: u32,
        /// Error of the final attempt.
        last: E,
    },

    /// The error was classified as not retryable.
    #[error("{0}")]
    Failed(E),

    /// The run was cancelled while waiting to retry.
    #[error("{0}")]
    Cancelled(E),

    /// The start timeout elapsed before the next attempt.
    #[error("{0}")]
    TimedOut(E),
}

impl<E> RetryError<E> {
    /// Returns the error of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Failed(e) | Self::Cancelled(e) | Self::TimedOut(e) => e,
        }
    }

    /// Borrows the error of the last attempt.
    pub fn last(&self) -> &E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Failed(e) | Self::Cancelled(e) | Self::TimedOut(e) => e,
        }
    }

    /// Returns true if the attempt budget ran out.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// How long to sleep between attempts.
pub enum RetryDelay {
    /// Same delay every time.
    Constant(Duration),
    /// Grows with each call.
    Backoff(Backoff),
    /// Caller-provided delay source.
    Custom(Box<dyn FnMut() -> Duration + Send>),
}

impl RetryDelay {
    /// Returns the next delay, advancing stateful strategies.
    pub fn next_delay(&mut self) -> Duration {
        match self {
            Self::Constant(d) => *d,
            Self::Backoff(b) => b.linear(),
            Self::Custom(f) => f(),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Constant(DEFAULT_RETRY_DELAY)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(d) => f.debug_tuple("Constant").field(d).finish(),
            Self::Backoff(b) => f.debug_tuple("Backoff").field(b).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

type ShouldRetry<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Policy for [`RetryPolicy::run`].
///
/// `tries == 0` means unlimited attempts; `start_timeout == 0` disables the
/// deadline. Without a classifier every error is retryable.
pub struct RetryPolicy<E> {
    /// Deadline after which no new attempt is started.
    pub start_timeout: Duration,
    /// Maximum number of attempts.
    pub tries: u32,
    should_retry: Option<ShouldRetry<E>>,
    delay: RetryDelay,
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self {
            start_timeout: Duration::ZERO,
            tries: 0,
            should_retry: None,
            delay: RetryDelay::default(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("start_timeout", &self.start_timeout)
            .field("tries", &self.tries)
            .field("should_retry", &self.should_retry.is_some())
            .field("delay", &self.delay)
            .finish()
    }
}

impl<E: fmt::Display> RetryPolicy<E> {
    /// Creates a policy with unlimited tries and the default delay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    /// Sets the deadline for starting new attempts.
    #[must_use]
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Sets the retryable-error classifier.
    #[must_use]
    pub fn with_should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Box::new(f));
        self
    }

    /// Sets a constant delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = RetryDelay::Constant(delay);
        self
    }

    /// Sets a growing delay.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.delay = RetryDelay::Backoff(backoff);
        self
    }

    /// Sets a custom delay source.
    #[must_use]
    pub fn with_delay_fn<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        self.delay = RetryDelay::Custom(Box::new(f));
        self
    }

    fn is_retryable(&self, err: &E) -> bool {
        self.should_retry.as_ref().map_or(true, |f| f(err))
    }

    /// Runs `op` until it succeeds or the policy gives up.
    ///
    /// The first attempt always runs. Sleeping between attempts is cut short
    /// by cancellation or by the start deadline, in which case the last
    /// error is returned as-is.
    pub async fn run<T, F, Fut>(
        &mut self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let deadline = (!self.start_timeout.is_zero()).then(|| Instant::now() + self.start_timeout);
        let mut attempt: u32 = 0;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;

            if !self.is_retryable(&err) {
                debug!(attempt, error = %err, "Error is not retryable");
                return Err(RetryError::Failed(err));
            }
            if self.tries > 0 && attempt >= self.tries {
                return Err(RetryError::Exhausted {
                    tries: attempt,
                    last: err,
                });
            }
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled(err));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(RetryError::TimedOut(err));
            }

            let delay = self.delay.next_delay();
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retryable error");

            let wait_deadline = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled(err)),
                () = wait_deadline => return Err(RetryError::TimedOut(err)),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Flaky(&'static str);

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let mut policy = RetryPolicy::new().with_tries(5).with_delay(Duration::ZERO);

        let result = policy
            .run(&token, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky("not yet"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_after_three_tries() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let mut policy = RetryPolicy::new().with_tries(3).with_delay(Duration::ZERO);

        let result: Result<(), _> = policy
            .run(&token, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky("always"))
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.last(), &Flaky("always"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            err.to_string(),
            "retry count exhausted after 3 attempt(s). Last err: always"
        );
    }

    #[tokio::test]
    async fn test_not_retryable_returns_raw_error_after_one_attempt() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let mut policy = RetryPolicy::new()
            .with_tries(3)
            .with_delay(Duration::ZERO)
            .with_should_retry(|_: &Flaky| false);

        let result: Result<(), _> = policy
            .run(&token, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky("fatal"))
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Failed(Flaky("fatal"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_sleep() {
        let token = Arc::new(CancellationToken::new());
        let mut policy = RetryPolicy::new().with_delay(Duration::from_secs(3600));

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel("interrupt");
            })
        };

        let result: Result<(), _> = tokio::time::timeout(
            Duration::from_secs(5),
            policy.run(&token, || async { Err(Flaky("down")) }),
        )
        .await
        .unwrap();

        canceller.await.unwrap();
        assert!(matches!(result, Err(RetryError::Cancelled(Flaky("down")))));
    }

    #[tokio::test]
    async fn test_start_timeout_stops_retrying() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let mut policy = RetryPolicy::new()
            .with_start_timeout(Duration::from_millis(30))
            .with_delay(Duration::from_millis(10));

        let result: Result<(), _> = policy
            .run(&token, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky("slow"))
            })
            .await;

        assert!(matches!(result, Err(RetryError::TimedOut(_))));
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_backoff_delays_are_used() {
        let token = CancellationToken::new();
        let mut policy = RetryPolicy::new()
            .with_tries(3)
            .with_backoff(Backoff::new(Duration::from_millis(1), 2.0));

        let result: Result<(), _> = policy.run(&token, || async { Err(Flaky("x")) }).await;
        assert!(result.unwrap_err().is_exhausted());
        assert!(matches!(policy.delay, RetryDelay::Backoff(ref b) if b.current() == Duration::from_millis(4)));
    }
}
