//! Token-bucket rate limiter for batch flushes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
///
/// Allows bursts up to `burst` tokens, refilling at `rate_per_sec` tokens
/// per second based on monotonic elapsed time.
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket starting at full capacity.
    ///
    /// `rate_per_sec` and `burst` are clamped to at least 1; config
    /// normalization enforces the same floor upstream.
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            rate_per_sec: f64::from(rate_per_sec.max(1)),
            burst,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(f64::from(self.burst));
        state.last_refill = now;
    }

    /// Try to take `tokens` without blocking.
    pub fn acquire(&self, tokens: u32) -> bool {
        if tokens == 0 {
            return true;
        }
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        self.refill(&mut state);
        if state.tokens >= f64::from(tokens) {
            state.tokens -= f64::from(tokens);
            true
        } else {
            false
        }
    }

    /// Wait until `tokens` are available or the deadline passes.
    ///
    /// Sleeps in increments bounded by the computed refill time, re-checking
    /// after each sleep. Returns `false` when the timeout expires first.
    pub async fn wait_and_acquire(&self, tokens: u32, timeout: Duration) -> bool {
        if tokens == 0 {
            return true;
        }
        let deadline = Instant::now() + timeout;

        loop {
            let wait_time = {
                let mut state = self.state.lock().expect("rate limiter lock poisoned");
                self.refill(&mut state);
                if state.tokens >= f64::from(tokens) {
                    state.tokens -= f64::from(tokens);
                    return true;
                }
                let needed = f64::from(tokens) - state.tokens;
                Duration::from_secs_f64(needed / self.rate_per_sec)
            };

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline.duration_since(now);
            let sleep_for = wait_time.min(remaining).min(Duration::from_millis(100));
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Currently available tokens (after refill).
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        self.refill(&mut state);
        state.tokens
    }

    /// Reset the bucket to full capacity.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        state.tokens = f64::from(self.burst);
        state.last_refill = Instant::now();
    }
}
