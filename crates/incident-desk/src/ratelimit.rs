//! Token-bucket rate limiter
//!
//! Bounds outbound HTTP load on the service desk. Callers block on an
//! empty bucket until replenishment; tokens refill continuously at
//! `capacity / window`.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuous-refill token bucket
pub struct TokenBucket {
    capacity: f64,
    window: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket allowing `capacity` acquisitions per `window`
    #[must_use]
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            window,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity.max(1)),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket allowing `per_minute` acquisitions per minute
    #[must_use]
    pub fn per_minute(per_minute: u32) -> Self {
        Self::new(per_minute, Duration::from_secs(60))
    }

    fn refill_rate_per_sec(&self) -> f64 {
        self.capacity / self.window.as_secs_f64()
    }

    /// Take one token, sleeping until one is available
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens =
                    (state.tokens + elapsed * self.refill_rate_per_sec()).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(
                        deficit / self.refill_rate_per_sec(),
                    ))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}
