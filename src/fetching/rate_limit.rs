//! Token-bucket rate limiter for outbound calls
//!
//! The bucket is refilled to full capacity at the start of every fixed-width
//! window (windows are aligned to the limiter's creation instant). All permits
//! of a window are available at once; there is no continuous trickle and no
//! fairness between concurrent callers.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::cancel::{CancelSignal, Cancelled};

/// Shared token-bucket limiter
#[derive(Debug)]
pub struct RateLimiter {
    /// Permits per window
    capacity: u32,
    /// Window width
    window: Duration,
    /// Mutable bucket state shared by all callers
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    permits: u32,
    next_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter allowing `capacity` calls per `window`
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = capacity.max(1);
        let window = window.max(Duration::from_millis(1));

        Self {
            capacity,
            window,
            state: Mutex::new(BucketState {
                permits: capacity,
                next_refill: Instant::now() + window,
            }),
        }
    }

    /// `n` calls per second
    pub fn per_second(n: u32) -> Self {
        Self::new(n, Duration::from_secs(1))
    }

    /// Wait for a permit and consume it.
    ///
    /// Returns `Err(Cancelled)` without consuming a permit if the signal
    /// fires before or during the wait.
    pub async fn acquire(&self, cancel: &CancelSignal) -> Result<(), Cancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            let wake_at = {
                let mut state = self.state.lock();
                self.refill(&mut state, Instant::now());
                if state.permits > 0 {
                    state.permits -= 1;
                    return Ok(());
                }
                state.next_refill
            };

            trace!("Rate limit reached, waiting {:?}", wake_at.saturating_duration_since(Instant::now()));

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = cancel.cancelled() => {
                    debug!("Rate limit wait cancelled");
                    return Err(Cancelled);
                }
            }
        }
    }

    /// Take a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Permits left in the current window
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.permits
    }

    /// Permits per window
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Window width
    pub fn window(&self) -> Duration {
        self.window
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if now < state.next_refill {
            return;
        }

        // Skip every window that passed without a caller, keeping alignment
        let behind = now.duration_since(state.next_refill).as_nanos();
        let windows_passed = behind / self.window.as_nanos() + 1;
        let advance = self.window.as_nanos().saturating_mul(windows_passed);

        state.next_refill = match u64::try_from(advance) {
            Ok(nanos) => state.next_refill + Duration::from_nanos(nanos),
            Err(_) => now + self.window,
        };
        state.permits = self.capacity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetching::cancel::cancel_pair;
    use std::collections::HashMap;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_capacity_per_window() {
        let never = CancelSignal::never();

        for (capacity, window_ms) in [(1u32, 100u64), (3, 1000), (5, 250), (10, 1000)] {
            let window = Duration::from_millis(window_ms);
            let limiter = RateLimiter::new(capacity, window);
            let start = Instant::now();

            let mut per_window: HashMap<u128, u32> = HashMap::new();
            for _ in 0..(capacity * 4 + 1) {
                limiter.acquire(&never).await.unwrap();
                let index = start.elapsed().as_nanos() / window.as_nanos();
                *per_window.entry(index).or_default() += 1;
            }

            assert!(
                per_window.values().all(|&count| count <= capacity),
                "capacity {} window {:?}: {:?}",
                capacity,
                window,
                per_window
            );
            assert_eq!(per_window.len(), 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_available_at_once() {
        let limiter = RateLimiter::per_second(4);
        let never = CancelSignal::never();
        let start = Instant::now();

        for _ in 0..4 {
            limiter.acquire(&never).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.available(), 0);
        assert!(!limiter.try_acquire());

        limiter.acquire(&never).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_windows_do_not_accumulate() {
        let limiter = RateLimiter::new(2, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(limiter.available(), 2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_wait() {
        let limiter = RateLimiter::per_second(1);
        let (handle, signal) = cancel_pair();
        handle.cancel();

        assert_eq!(limiter.acquire(&signal).await, Err(Cancelled));
        // No permit consumed
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_wait() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let (handle, signal) = cancel_pair();
        limiter.acquire(&signal).await.unwrap();

        let start = Instant::now();
        let waiter = limiter.acquire(&signal);
        let canceller = async {
            tokio::task::yield_now().await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(waiter, canceller);

        assert_eq!(result, Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
