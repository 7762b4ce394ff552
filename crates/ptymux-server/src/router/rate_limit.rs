//! Token-bucket admission control for inbound keystrokes.
//!
//! One bucket per connection. Admission is all-or-nothing: a request for more
//! tokens than are available is refused and costs nothing. There is no
//! queueing; callers drop what is refused.

use std::time::{Duration, Instant};

/// Default bucket size in tokens (bytes).
pub const DEFAULT_CAPACITY: u32 = 32_768;

/// Default refill rate in tokens per second.
pub const DEFAULT_REFILL_PER_SEC: u32 = 16_384;

/// Bucket parameters shared by every connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_per_sec: DEFAULT_REFILL_PER_SEC,
        }
    }
}

/// A token bucket that starts full.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    /// Create a bucket whose refill clock starts at `now`.
    pub fn new_at(config: RateLimitConfig, now: Instant) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            capacity,
            refill_per_sec: f64::from(config.refill_per_sec),
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Try to take `n` tokens. Returns `true` if admitted.
    pub fn admit(&mut self, n: usize) -> bool {
        self.admit_at(n, Instant::now())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock reading.
    pub fn admit_at(&mut self, n: usize, now: Instant) -> bool {
        self.refill(now);
        let wanted = n as f64;
        if wanted <= self.tokens {
            self.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Tokens available as of the last refill.
    #[cfg(test)]
    pub fn available(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        // A clock reading older than the last refill adds nothing.
        let elapsed = now
            .checked_duration_since(self.last_refill)
            .unwrap_or(Duration::ZERO);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}
