//! Global reply-rate limiter.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: starts full, refills continuously, never goes negative.
///
/// Waiters queue on the internal async mutex, so tokens are handed out in arrival order.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate` is tokens per second and must be positive.
    pub fn new(capacity: u32, rate: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            rate: if rate > 0.0 { rate } else { 1.0 / 60.0 },
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// `max(1, n)` tokens, refilled at `max(1, n)` per minute.
    pub fn per_minute(n: u32) -> Self {
        let n = n.max(1);
        Self::new(n, f64::from(n) / 60.0)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = f64::min(self.capacity, state.tokens + elapsed * self.rate);
        state.last_refill = now;
    }

    /// Take one token, suspending until one is available.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            self.refill(&mut state, Instant::now());
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }
            let wait = (1.0 - state.tokens) / self.rate;
            tokio::time::sleep(Duration::from_secs_f64(wait.max(0.01))).await;
        }
    }

    /// Take one token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity() {
        let bucket = TokenBucket::per_minute(3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::per_minute(1);
        bucket.acquire().await;

        let mut next = task::spawn(bucket.acquire());
        assert_pending!(next.poll());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_pending!(next.poll());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_ready!(next.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity_plus_refill() {
        let bucket = TokenBucket::per_minute(20);
        let window = Duration::from_secs(90);
        let start = Instant::now();
        let mut granted = 0u32;
        while Instant::now().duration_since(start) < window {
            if bucket.try_acquire() {
                granted += 1;
            } else {
                tokio::time::advance(Duration::from_millis(100)).await;
            }
        }
        // 20 up front + 20/60 per second for 90 s
        assert!(granted <= 20 + 30, "granted {}", granted);
        assert!(granted >= 49);
    }

    #[test]
    fn zero_is_treated_as_one() {
        let bucket = TokenBucket::per_minute(0);
        assert_eq!(bucket.capacity(), 1);
    }
}
