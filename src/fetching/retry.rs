//! Retry executor with transient/non-transient failure classification
//!
//! Operations are attempted strictly sequentially, at most `max_retries + 1`
//! times, with a fixed delay between attempts. Only transient failures are
//! retried; the last error is always handed back to the caller.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cancel::CancelSignal;

/// Keywords that mark an error message as network-related
const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "socket",
    "unreachable",
    "reset",
    "unavailable",
];

/// Marker that forces non-transient classification
const NON_TRANSIENT_MARKER: &str = "non-transient";

/// Whether a failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    NonTransient,
}

/// Errors that know whether they are transient
pub trait Classify {
    fn failure_class(&self) -> FailureClass;
}

/// Classify a failure purely from its message
pub fn classify_message(message: &str) -> FailureClass {
    let lower = message.to_lowercase();

    if lower.contains(NON_TRANSIENT_MARKER) {
        return FailureClass::NonTransient;
    }

    if TRANSIENT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FailureClass::Transient
    } else {
        FailureClass::NonTransient
    }
}

/// Classify an I/O error by kind, falling back to its message
pub fn classify_io(err: &std::io::Error) -> FailureClass {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::AddrNotAvailable
        | ErrorKind::Interrupted => FailureClass::Transient,
        _ => classify_message(&err.to_string()),
    }
}

/// Retry budget and delay
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Final failure of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{label} failed after {attempts} attempt(s): {error}")]
    Exhausted {
        label: String,
        attempts: u32,
        #[source]
        error: E,
    },

    #[error("{label} failed with non-transient error: {error}")]
    NonTransient {
        label: String,
        #[source]
        error: E,
    },

    #[error("{label} cancelled after {attempts} attempt(s)")]
    Cancelled {
        label: String,
        attempts: u32,
        last: Option<E>,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Number of times the operation was invoked
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => *attempts,
            RetryError::NonTransient { .. } => 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// The last error produced by the operation, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonTransient { error, .. } => Some(error),
            RetryError::Cancelled { last, .. } => last,
        }
    }
}

/// Sequential retry executor
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails non-transiently, runs out of
    /// attempts or is cancelled. The closure receives the 1-based attempt.
    pub async fn execute<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: &CancelSignal,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + 'static,
    {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut last_error: Option<E> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                info!("{} cancelled before attempt {}", label, attempt);
                return Err(RetryError::Cancelled {
                    label: label.to_string(),
                    attempts: attempt - 1,
                    last: last_error,
                });
            }

            let err = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}/{}", label, attempt, max_attempts);
                    } else {
                        debug!("{} succeeded", label);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.failure_class() == FailureClass::NonTransient {
                warn!("{} failed with non-transient error: {}", label, err);
                return Err(RetryError::NonTransient {
                    label: label.to_string(),
                    error: err,
                });
            }

            if attempt == max_attempts {
                error!("{} failed after {} attempt(s): {}", label, attempt, err);
                return Err(RetryError::Exhausted {
                    label: label.to_string(),
                    attempts: attempt,
                    error: err,
                });
            }

            warn!(
                "{} attempt {}/{} failed with transient error: {}; retrying in {:?}",
                label, attempt, max_attempts, err, self.policy.delay
            );
            last_error = Some(err);

            if cancel.sleep(self.policy.delay).await.is_err() {
                warn!("{} retry interrupted by cancellation", label);
                return Err(RetryError::Cancelled {
                    label: label.to_string(),
                    attempts: attempt,
                    last: last_error,
                });
            }
        }

        // max_attempts >= 1, so the loop always returns
        Err(RetryError::Cancelled {
            label: label.to_string(),
            attempts: max_attempts,
            last: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetching::cancel::cancel_pair;
    use crate::fetching::fetcher::FetchError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy {
            max_retries,
            delay: Duration::from_millis(500),
        })
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(classify_message("Read timeout"), FailureClass::Transient);
        assert_eq!(classify_message("Connection refused"), FailureClass::Transient);
        assert_eq!(classify_message("host unreachable"), FailureClass::Transient);
        assert_eq!(classify_message("Service Unavailable"), FailureClass::Transient);
        assert_eq!(classify_message("peer reset the stream"), FailureClass::Transient);
        assert_eq!(classify_message("bad checksum"), FailureClass::NonTransient);
        assert_eq!(
            classify_message("Non-transient connection timeout"),
            FailureClass::NonTransient
        );
    }

    #[test]
    fn test_classify_io() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(classify_io(&timed_out), FailureClass::Transient);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify_io(&denied), FailureClass::NonTransient);

        let other = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");
        assert_eq!(classify_io(&other), FailureClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retried_until_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor(3)
            .execute("fetch", &CancelSignal::never(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Timeout(Duration::from_secs(30))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::Exhausted { attempts, error, .. }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(error, FetchError::Timeout(_)));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_argument_fails_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor(3)
            .execute("fetch", &CancelSignal::never(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::InvalidArgument("Non-transient error".to_string())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert!(matches!(err, RetryError::NonTransient { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let start = tokio::time::Instant::now();
        let result = executor(3)
            .execute("fetch", &CancelSignal::never(), |attempt| async move {
                if attempt < 3 {
                    Err(FetchError::Other("connection reset by peer".to_string()))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor(0)
            .execute("fetch", &CancelSignal::never(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Timeout(Duration::from_secs(1))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_delay() {
        let (handle, signal) = cancel_pair();
        let calls = AtomicU32::new(0);

        let executor = executor(5);
        let retried = executor.execute("fetch", &signal, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(FetchError::Timeout(Duration::from_secs(1))) }
        });
        let canceller = async {
            tokio::task::yield_now().await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(retried, canceller);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert!(matches!(err.into_inner(), Some(FetchError::Timeout(_))));
    }
}
