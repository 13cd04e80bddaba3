//! Run-wide cancellation signal
//!
//! A single signal observed by the rate limiter, retry delays and in-flight
//! fetches, so one Ctrl-C aborts every kind of wait the same way.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Returned by any wait that was aborted by the cancellation signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Owner side: fires the signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observer side: cheap to clone, handed to every stage
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another observer of this handle
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    /// A signal that never fires (tests, one-off tools)
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Non-blocking check
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires; pends forever if it never can
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without firing
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration` unless cancelled first
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_fires() {
        let (handle, signal) = cancel_pair();
        let other = handle.signal();
        assert!(!signal.is_cancelled());

        handle.cancel();
        assert!(signal.is_cancelled());
        assert!(other.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted() {
        let (handle, signal) = cancel_pair();
        let start = tokio::time::Instant::now();

        let sleeper = signal.sleep(Duration::from_secs(3600));
        let canceller = async {
            tokio::task::yield_now().await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(sleeper, canceller);

        assert_eq!(result, Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_sleeps_normally() {
        let signal = CancelSignal::never();
        assert!(signal.sleep(Duration::from_millis(50)).await.is_ok());
        assert!(!signal.is_cancelled());
    }
}
