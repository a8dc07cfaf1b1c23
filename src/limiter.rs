//! Download rate limiting.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Token bucket shared by every segment worker of an engine.
///
/// One token is one byte. A rate of 0 disables limiting.
#[derive(Clone)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

struct Bucket {
    /// Burst size; equal to one second worth of tokens.
    capacity: u64,
    tokens: u64,
    rate: u64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        if self.rate == 0 {
            self.tokens = self.capacity;
            return;
        }
        let now = Instant::now();
        let earned = (now.duration_since(self.last_refill).as_secs_f64() * self.rate as f64) as u64;
        if earned > 0 {
            self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
            self.last_refill = now;
        }
    }
}

fn capacity_for(rate: u64) -> u64 {
    if rate == 0 {
        u64::MAX
    } else {
        rate
    }
}

impl SpeedLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = capacity_for(rate_bytes_per_sec);
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                capacity,
                tokens: capacity,
                rate: rate_bytes_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Waits until `amount` bytes may pass.
    ///
    /// Requests larger than the burst size are admitted in burst-sized steps.
    pub async fn take(&self, amount: u64) {
        let mut remaining = amount;
        while remaining > 0 {
            let mut bucket = self.bucket.lock().await;
            bucket.refill();

            let step = remaining.min(bucket.capacity);
            if bucket.tokens >= step {
                bucket.tokens -= step;
                remaining -= step;
                continue;
            }

            let missing = step - bucket.tokens;
            let wait = Duration::from_secs_f64(missing as f64 / bucket.rate.max(1) as f64);
            // never sleep holding the lock
            drop(bucket);
            tokio::time::sleep(wait).await;
        }
    }
}
