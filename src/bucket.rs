//! Token bucket arithmetic shared by the in-process store and mirrored by
//! the Redis script.

use std::time::Duration;

/// Longest time a policy may take to refill an empty bucket. Durations
/// derived from bucket parameters saturate here.
pub const MAX_REFILL_PERIOD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Convert float seconds to a `Duration`, saturating at `MAX_REFILL_PERIOD`
pub fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_REFILL_PERIOD)
        .min(MAX_REFILL_PERIOD)
}

/// Parameters a store needs to evaluate one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Idle time after which the state may be dropped
    pub ttl: Duration,
}

/// Persisted state of one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: Duration,
}

/// Result of an atomic check-and-consume
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    pub tokens: f64,
    pub admitted: bool,
}

impl BucketState {
    /// State of a bucket seen for the first time
    pub fn full(params: &BucketParams, now: Duration) -> Self {
        Self {
            tokens: params.capacity,
            last_refill: now,
        }
    }

    /// Top the bucket up for the time elapsed since the last refill.
    /// A clock that moved backwards adds nothing.
    pub fn refill(&mut self, params: &BucketParams, now: Duration) {
        let elapsed = now.saturating_sub(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * params.refill_rate).min(params.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    /// Refill, then take `cost` tokens if available. The refill is recorded
    /// whether or not the request is admitted.
    pub fn consume(&mut self, params: &BucketParams, cost: u64, now: Duration) -> ConsumeOutcome {
        self.refill(params, now);

        let cost = cost as f64;
        let admitted = self.tokens >= cost;
        if admitted {
            self.tokens -= cost;
        }

        ConsumeOutcome {
            tokens: self.tokens,
            admitted,
        }
    }
}

/// Time until `cost` tokens will be available, or `None` when the bucket can
/// never hold that many.
pub fn retry_after(params: &BucketParams, cost: u64, tokens: f64) -> Option<Duration> {
    let cost = cost as f64;
    if cost > params.capacity || params.refill_rate <= 0.0 {
        return None;
    }
    let deficit = (cost - tokens).max(0.0);
    Some(saturating_secs(deficit / params.refill_rate))
}
