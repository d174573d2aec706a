// Rate limiter for citation database requests
// Token bucket with hourly refill, async acquisition, and 429 drain

use crate::providers::RateLimitConfig;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            capacity,
            refill_rate,
        }
    }

    fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();

        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        let tokens_to_add = elapsed * self.refill_rate;
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
        self.last_refill = now;
    }

    fn time_until_available(&mut self, tokens: f64) -> Duration {
        self.refill();

        if self.tokens >= tokens {
            Duration::from_secs(0)
        } else {
            let needed_tokens = tokens - self.tokens;
            let wait_time = needed_tokens / self.refill_rate;
            Duration::from_secs_f64(wait_time)
        }
    }

    fn drain(&mut self) {
        self.tokens = 0.0;
        self.last_refill = Instant::now();
    }
}

/// Per-database token bucket. One instance is shared by every verification
/// task in the process; the hourly budget refills continuously.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let rate = config.requests_per_hour as f64 / 3600.0;
        let capacity = config.burst_limit.max(1) as f64;

        debug!(
            "Creating rate limiter: {:.4} tokens/sec, {} capacity",
            rate, capacity
        );

        Self {
            bucket: Mutex::new(TokenBucket::new(capacity, rate)),
        }
    }

    /// Take one token, suspending until one refills or the job is cancelled.
    /// Returns false when cancelled.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_consume(1.0) {
                    return true;
                }
                bucket.time_until_available(1.0)
            };

            debug!("Rate limit reached, waiting {:?}", wait);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    debug!("Rate limit wait cancelled");
                    return false;
                }
            }
        }
    }

    /// Non-blocking variant used by the synchronous analyze path.
    pub async fn try_acquire(&self) -> bool {
        self.bucket.lock().await.try_consume(1.0)
    }

    /// Empty the bucket after a server-side 429 so pending verifications
    /// back off together, then wait at least `retry_after` when given.
    pub async fn throttle(&self, retry_after: Option<Duration>) {
        {
            let mut bucket = self.bucket.lock().await;
            bucket.drain();
        }
        if let Some(wait) = retry_after {
            warn!("Server requested throttle, sleeping {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token count, rounded down. Exposed through health reporting.
    pub async fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        bucket.tokens as u32
    }
}
