//! Bandwidth pacing — a global byte bucket shared by every transmission.
//!
//! Refill rate is the configured link bandwidth. Each chunk reserves its
//! frame length before delivery; reservations may drive the bucket negative,
//! in which case the caller sleeps until its bytes have "drained". Concurrent
//! transmissions therefore share capacity instead of each seeing the full
//! link to itself.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ByteBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl ByteBucket {
    /// A bucket refilling at `rate` bytes/sec with one second of burst.
    pub fn new(rate: u64) -> Self {
        let rate = rate as f64;
        Self {
            tokens: rate,
            capacity: rate,
            rate,
            last_refill: Instant::now(),
        }
    }

    /// Retarget the refill rate after a config update.
    /// Accumulated debt is preserved so in-flight pacing stays fair.
    pub fn set_rate(&mut self, rate: u64) {
        self.refill();
        let rate = rate as f64;
        self.rate = rate;
        self.capacity = rate;
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Reserve `bytes` of link capacity.
    ///
    /// Returns how long the caller must wait before its bytes are on the
    /// wire. Zero when the bucket has credit.
    pub fn reserve(&mut self, bytes: usize) -> Duration {
        self.refill();
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}
