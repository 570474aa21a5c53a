//! Token bucket used by the per-caller rate limiter.
//!
//! Tokens refill lazily from timestamps supplied by the caller, so the bucket
//! needs no background task and is deterministic under test clocks.
//!
//! - Bucket holds up to `capacity` tokens and starts full.
//! - Tokens refill at `refill_rate` tokens per second.
//! - A denied acquisition reports how long until it would succeed; callers
//!   turn that into a `retry_after` hint rather than dropping the request.

use serde::{Deserialize, Serialize};

/// A lazily refilled token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    tokens: f64,
    /// Last refill timestamp (milliseconds on the caller's clock).
    last_refill_ms: u64,
    total_consumed: u64,
    total_denied: u64,
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    /// Tokens were taken; `remaining` is what is left afterwards.
    Granted { remaining: f64 },
    /// Not enough tokens; retry after `retry_after_ms`.
    Denied { retry_after_ms: u64 },
}

impl Acquire {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

impl TokenBucket {
    /// Create a full bucket whose clock starts at `now_ms`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `refill_rate` is not positive.
    #[must_use]
    pub fn new(capacity: f64, refill_rate: f64, now_ms: u64) -> Self {
        assert!(capacity > 0.0, "capacity must be positive");
        assert!(refill_rate > 0.0, "refill_rate must be positive");
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill_ms: now_ms,
            total_consumed: 0,
            total_denied: 0,
        }
    }

    /// Create an empty bucket whose clock starts at `now_ms`.
    #[must_use]
    pub fn new_empty(capacity: f64, refill_rate: f64, now_ms: u64) -> Self {
        let mut bucket = Self::new(capacity, refill_rate, now_ms);
        bucket.tokens = 0.0;
        bucket
    }

    fn refill(&mut self, now_ms: u64) {
        if now_ms <= self.last_refill_ms {
            return;
        }
        let elapsed_secs = (now_ms - self.last_refill_ms) as f64 / 1000.0;
        self.tokens = elapsed_secs.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        self.last_refill_ms = now_ms;
    }

    /// Try to take `cost` tokens.
    pub fn acquire(&mut self, cost: u32, now_ms: u64) -> Acquire {
        self.refill(now_ms);
        let cost_f = f64::from(cost);
        if self.tokens >= cost_f {
            self.tokens -= cost_f;
            self.total_consumed += u64::from(cost);
            Acquire::Granted {
                remaining: self.tokens,
            }
        } else {
            self.total_denied += 1;
            Acquire::Denied {
                retry_after_ms: self.deficit_ms(cost_f),
            }
        }
    }

    /// Milliseconds until `cost` tokens are available (0 if already available).
    #[must_use]
    pub fn wait_time_ms(&mut self, cost: u32, now_ms: u64) -> u64 {
        self.refill(now_ms);
        self.deficit_ms(f64::from(cost))
    }

    /// Milliseconds until the bucket is full again.
    #[must_use]
    pub fn reset_after_ms(&mut self, now_ms: u64) -> u64 {
        self.refill(now_ms);
        self.deficit_ms(self.capacity)
    }

    fn deficit_ms(&self, wanted: f64) -> u64 {
        let deficit = wanted - self.tokens;
        if deficit <= 0.0 {
            0
        } else {
            (deficit / self.refill_rate * 1000.0).ceil() as u64
        }
    }

    /// Current number of available tokens.
    #[must_use]
    pub fn available(&mut self, now_ms: u64) -> f64 {
        self.refill(now_ms);
        self.tokens
    }

    /// Whether the bucket has refilled completely since `now_ms`.
    #[must_use]
    pub fn is_full(&mut self, now_ms: u64) -> bool {
        self.available(now_ms) >= self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    #[must_use]
    pub fn total_consumed(&self) -> u64 {
        self.total_consumed
    }

    #[must_use]
    pub fn total_denied(&self) -> u64 {
        self.total_denied
    }

    /// Statistics as of the last refill.
    #[must_use]
    pub fn stats(&self) -> BucketStats {
        BucketStats {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            current_tokens: self.tokens,
            total_consumed: self.total_consumed,
            total_denied: self.total_denied,
            fill_ratio: self.tokens / self.capacity,
        }
    }
}

/// Serializable statistics about a token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStats {
    pub capacity: f64,
    pub refill_rate: f64,
    pub current_tokens: f64,
    pub total_consumed: u64,
    pub total_denied: u64,
    /// current / capacity
    pub fill_ratio: f64,
}

/// Serializable configuration for creating a token bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum tokens (burst size).
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
    /// Whether to start empty (default: start full).
    #[serde(default)]
    pub start_empty: bool,
}

impl BucketConfig {
    /// Create a token bucket from this configuration.
    #[must_use]
    pub fn build(&self, now_ms: u64) -> TokenBucket {
        if self.start_empty {
            TokenBucket::new_empty(self.capacity, self.refill_rate, now_ms)
        } else {
            TokenBucket::new(self.capacity, self.refill_rate, now_ms)
        }
    }
}
