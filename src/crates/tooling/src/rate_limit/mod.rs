//! Rate limiting utilities
//!
//! Two limiter algorithms with the same acquisition contract: the caller asks
//! for a permit and either gets one immediately or is told how long to wait
//! before asking again. Returning the wait time (instead of sleeping
//! internally) lets callers interleave the wait with cancellation and report
//! it to observers.
//!
//! Timekeeping uses [`tokio::time::Instant`] so paused-clock tests advance
//! the limiters deterministically.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Wait applied when a limiter can never recover on its own (refill rate of
/// zero). Callers are expected to race the sleep against cancellation.
pub const WAIT_FOREVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Result of a permit request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquireOutcome {
    /// A permit was taken; proceed immediately.
    Ready,
    /// No permit available; retry after the given wait.
    WaitFor(Duration),
}

impl AcquireOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, AcquireOutcome::Ready)
    }
}

/// Token bucket limiter: capacity `C`, refilled at `R` tokens per second.
///
/// Each call consumes one token. When the bucket is empty the outcome carries
/// the time until one token will have accrued.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket holding `capacity` tokens, refilled at
    /// `refill_per_sec` tokens per second. The bucket starts full.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Request one permit.
    pub async fn try_acquire(&self) -> AcquireOutcome {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if self.refill_per_sec > 0.0 {
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        }
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return AcquireOutcome::Ready;
        }
        if self.refill_per_sec <= 0.0 {
            return AcquireOutcome::WaitFor(WAIT_FOREVER);
        }
        let deficit = 1.0 - state.tokens;
        AcquireOutcome::WaitFor(Duration::from_secs_f64(deficit / self.refill_per_sec))
    }

    /// Number of whole tokens currently available.
    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if self.refill_per_sec > 0.0 {
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;
        }
        state.tokens.floor() as u32
    }
}

/// Fixed window limiter: at most `limit` permits per window of `window`
/// duration. Excess requests wait for the window to roll over.
pub struct FixedWindow {
    limit: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    window_start: Instant,
    count: u32,
}

impl FixedWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Request one permit.
    pub async fn try_acquire(&self) -> AcquireOutcome {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        // Roll the window forward to the one containing `now`. Stepping in
        // whole windows keeps boundaries aligned across idle stretches.
        while now.duration_since(state.window_start) >= self.window {
            state.window_start += self.window;
            state.count = 0;
        }

        if state.count < self.limit {
            state.count += 1;
            return AcquireOutcome::Ready;
        }
        let rollover = state.window_start + self.window;
        AcquireOutcome::WaitFor(rollover.duration_since(now))
    }

    /// Permits already granted in the current window.
    pub async fn current_count(&self) -> u32 {
        let state = self.state.lock().await;
        state.count
    }
}

/// A limiter of either algorithm behind one acquisition call.
pub enum RateLimiter {
    TokenBucket(TokenBucket),
    FixedWindow(FixedWindow),
}

impl RateLimiter {
    pub fn token_bucket(capacity: u32, refill_per_sec: f64) -> Self {
        Self::TokenBucket(TokenBucket::new(capacity, refill_per_sec))
    }

    pub fn fixed_window(limit: u32, window: Duration) -> Self {
        Self::FixedWindow(FixedWindow::new(limit, window))
    }

    pub async fn try_acquire(&self) -> AcquireOutcome {
        match self {
            Self::TokenBucket(b) => b.try_acquire().await,
            Self::FixedWindow(w) => w.try_acquire().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_allows_capacity_then_waits() {
        let bucket = TokenBucket::new(3, 1.0);

        for _ in 0..3 {
            assert!(bucket.try_acquire().await.is_ready());
        }

        match bucket.try_acquire().await {
            AcquireOutcome::WaitFor(wait) => {
                assert!(wait <= Duration::from_secs(1));
                assert!(wait > Duration::from_millis(900));
            }
            AcquireOutcome::Ready => panic!("bucket should be empty"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(2, 10.0);

        assert!(bucket.try_acquire().await.is_ready());
        assert!(bucket.try_acquire().await.is_ready());
        assert!(!bucket.try_acquire().await.is_ready());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(bucket.try_acquire().await.is_ready());
    }

    #[tokio::test]
    async fn zero_refill_waits_forever() {
        let bucket = TokenBucket::new(2, 0.0);

        assert!(bucket.try_acquire().await.is_ready());
        assert!(bucket.try_acquire().await.is_ready());

        match bucket.try_acquire().await {
            AcquireOutcome::WaitFor(wait) => assert_eq!(wait, WAIT_FOREVER),
            AcquireOutcome::Ready => panic!("no tokens should remain"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_window_rolls_over() {
        let window = FixedWindow::new(2, Duration::from_secs(1));

        assert!(window.try_acquire().await.is_ready());
        assert!(window.try_acquire().await.is_ready());

        let wait = match window.try_acquire().await {
            AcquireOutcome::WaitFor(wait) => wait,
            AcquireOutcome::Ready => panic!("window should be exhausted"),
        };
        assert!(wait <= Duration::from_secs(1));

        tokio::time::advance(wait).await;
        assert!(window.try_acquire().await.is_ready());
        assert_eq!(window.current_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_available_tracks_refill() {
        let bucket = TokenBucket::new(5, 1.0);
        assert_eq!(bucket.available().await, 5);

        bucket.try_acquire().await;
        bucket.try_acquire().await;
        assert_eq!(bucket.available().await, 3);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.available().await, 4);
    }
}
