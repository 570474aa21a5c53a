//! Per-caller, per-class request rate limiting.
//!
//! Each `(caller, operation class)` pair gets its own [`TokenBucket`],
//! created lazily from the class's [`BucketConfig`]. A request that finds
//! its bucket empty is refused with [`ResilienceError::RateLimited`] and a
//! `retry_after_ms` hint; nothing is dropped silently.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ResilienceConfig;
use crate::error::ResilienceError;
use crate::priority::OperationClass;
use crate::token_bucket::{Acquire, BucketConfig, TokenBucket};

type BucketKey = (String, OperationClass);

/// Result of an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    /// Whole tokens left in the caller's bucket.
    pub remaining: u64,
    /// Milliseconds until the bucket is full again.
    pub reset_after_ms: u64,
}

/// Per-bucket view for the detailed health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub caller: String,
    pub class: OperationClass,
    pub remaining: u64,
    pub reset_after_ms: u64,
    pub total_consumed: u64,
    pub total_denied: u64,
}

/// Aggregate rate limiter state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub tracked_buckets: usize,
    pub total_consumed: u64,
    pub total_denied: u64,
    pub buckets: Vec<RateLimitEntry>,
}

/// Token-bucket rate limiter keyed by caller and operation class.
#[derive(Debug)]
pub struct RateLimiter {
    configs: BTreeMap<OperationClass, BucketConfig>,
    buckets: Mutex<HashMap<BucketKey, TokenBucket>>,
    origin: Instant,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_tokens(tokens: f64) -> u64 {
    tokens.max(0.0).floor() as u64
}

impl RateLimiter {
    /// Build a limiter, configuring each class with `config_for`.
    pub fn new(config_for: impl Fn(OperationClass) -> BucketConfig) -> Self {
        Self {
            configs: OperationClass::ALL
                .into_iter()
                .map(|class| (class, config_for(class)))
                .collect(),
            buckets: Mutex::new(HashMap::new()),
            origin: Instant::now(),
        }
    }

    #[must_use]
    pub fn uniform(config: &BucketConfig) -> Self {
        Self::new(|_| config.clone())
    }

    #[must_use]
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(|class| config.bucket_for(class))
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<BucketKey, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Charge one request to `caller` for `class`.
    pub fn check(
        &self,
        caller: &str,
        class: OperationClass,
    ) -> Result<RateDecision, ResilienceError> {
        self.check_at(caller, class, self.now_ms())
    }

    /// Charge one request at an explicit clock reading (milliseconds).
    pub fn check_at(
        &self,
        caller: &str,
        class: OperationClass,
        now_ms: u64,
    ) -> Result<RateDecision, ResilienceError> {
        let mut buckets = self.buckets();
        let bucket = buckets
            .entry((caller.to_string(), class))
            .or_insert_with(|| self.configs[&class].build(now_ms));
        match bucket.acquire(1, now_ms) {
            Acquire::Granted { remaining } => Ok(RateDecision {
                remaining: whole_tokens(remaining),
                reset_after_ms: bucket.reset_after_ms(now_ms),
            }),
            Acquire::Denied { retry_after_ms } => {
                debug!(
                    caller,
                    operation_class = %class,
                    retry_after_ms,
                    "Rate limit exceeded"
                );
                Err(ResilienceError::RateLimited {
                    class: class.as_str().to_string(),
                    retry_after_ms,
                })
            }
        }
    }

    /// Remaining quota without charging. Untracked pairs report a full bucket.
    #[must_use]
    pub fn peek(&self, caller: &str, class: OperationClass) -> RateDecision {
        let now_ms = self.now_ms();
        let mut buckets = self.buckets();
        match buckets.get_mut(&(caller.to_string(), class)) {
            Some(bucket) => RateDecision {
                remaining: whole_tokens(bucket.available(now_ms)),
                reset_after_ms: bucket.reset_after_ms(now_ms),
            },
            None => RateDecision {
                remaining: whole_tokens(self.configs[&class].capacity),
                reset_after_ms: 0,
            },
        }
    }

    /// Drop buckets that have refilled completely; they are recreated full
    /// on the next request. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(self.now_ms())
    }

    pub fn prune_idle_at(&self, now_ms: u64) -> usize {
        let mut buckets = self.buckets();
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_full(now_ms));
        before - buckets.len()
    }

    #[must_use]
    pub fn snapshot(&self) -> RateLimitSnapshot {
        let now_ms = self.now_ms();
        let mut buckets = self.buckets();
        let mut entries: Vec<RateLimitEntry> = buckets
            .iter_mut()
            .map(|((caller, class), bucket)| RateLimitEntry {
                caller: caller.clone(),
                class: *class,
                remaining: whole_tokens(bucket.available(now_ms)),
                reset_after_ms: bucket.reset_after_ms(now_ms),
                total_consumed: bucket.total_consumed(),
                total_denied: bucket.total_denied(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.caller, a.class).cmp(&(&b.caller, b.class)));
        RateLimitSnapshot {
            tracked_buckets: entries.len(),
            total_consumed: entries.iter().map(|e| e.total_consumed).sum(),
            total_denied: entries.iter().map(|e| e.total_denied).sum(),
            buckets: entries,
        }
    }
}
