//! Process-wide request throttling.
//!
//! A leaky bucket holding at most `capacity` tokens that drains continuously
//! over `period`. One `RateLimiter` is created at startup and shared through an
//! `Arc` by every dispatcher, so the limit applies to the whole process.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_REQUESTS_PER_PERIOD: u32 = 100;
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Bucket {
    level: f64,
    last_drain: Instant,
}

/// Throttles callers to `capacity` acquisitions per `period`.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    drain_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, period: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        let period_secs = period.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity,
            drain_per_sec: capacity / period_secs,
            bucket: Mutex::new(Bucket {
                level: 0.0,
                last_drain: Instant::now(),
            }),
        }
    }

    /// Waits until one more request fits in the bucket, then takes its token.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_drain).as_secs_f64();
                bucket.level = (bucket.level - elapsed * self.drain_per_sec).max(0.0);
                bucket.last_drain = now;

                if bucket.level + 1.0 <= self.capacity {
                    bucket.level += 1.0;
                    return;
                }
                let overflow = bucket.level + 1.0 - self.capacity;
                Duration::from_secs_f64(overflow / self.drain_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_PERIOD, DEFAULT_PERIOD)
    }
}
