//! Token-bucket rate limiter with byte granularity
//!
//! One limiter is shared by every connection of a rule; the policy is an
//! aggregate throughput cap, not per-connection fairness.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    /// Token balance in bytes. Goes negative under load so that concurrent
    /// callers queue behind the accumulated debt and aggregate admission
    /// stays at the configured rate.
    tokens: f64,
    last_refill: Instant,
}

/// Byte-granular token bucket. Capacity equals the rate, i.e. a one-second
/// burst. A zero rate disables limiting entirely.
pub struct RateLimiter {
    rate: u64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bytes per second this limiter admits; 0 means unlimited.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Admit `n` bytes, sleeping as long as it takes the bucket to cover
    /// them. Returns immediately while the balance stays non-negative.
    pub async fn wait(&self, n: usize) {
        if self.rate == 0 || n == 0 {
            return;
        }

        let delay = {
            let mut bucket = self.bucket.lock().unwrap();
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.last_refill = now;

            let capacity = self.rate as f64;
            bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
            bucket.tokens -= n as f64;

            if bucket.tokens < 0.0 {
                Duration::from_secs_f64(-bucket.tokens / capacity)
            } else {
                Duration::ZERO
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_zero_rate_is_passthrough() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        limiter.wait(50 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_burst_within_capacity_is_immediate() {
        let limiter = RateLimiter::new(1024 * 1024);
        let start = Instant::now();
        limiter.wait(1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_deficit_sleeps_at_rate() {
        let limiter = RateLimiter::new(1024 * 1024);
        let start = Instant::now();
        // Burst drains the bucket, the second call owes 512 KiB of debt.
        limiter.wait(1024 * 1024).await;
        limiter.wait(512 * 1024).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_waiters_share_the_rate() {
        let limiter = Arc::new(RateLimiter::new(1024 * 1024));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.wait(512 * 1024).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 2 MiB total against a 1 MiB bucket plus 1 MiB/s refill: at least
        // one second of combined debt.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(800), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2500), "{elapsed:?}");
    }
}
