use async_trait::async_trait;
use std::time::Duration;

use crate::{
    bucket::{BucketParams, ConsumeOutcome},
    error::StoreResult,
};

/// Owner of all bucket state.
///
/// `check_and_consume` must refill, test and debit one key as a single
/// indivisible step: two callers racing on the same key may never both be
/// admitted for the last token. Callers on different keys must not block
/// each other.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Refill the bucket at `key` up to `now`, then take `cost` tokens if
    /// available. Absent state counts as a full bucket.
    async fn check_and_consume(
        &self,
        key: &str,
        params: &BucketParams,
        cost: u64,
        now: Duration,
    ) -> StoreResult<ConsumeOutcome>;

    /// Drop the state for `key`, returning it to full capacity
    async fn reset(&self, key: &str) -> StoreResult<()>;

    /// Health check for the store
    async fn health_check(&self) -> StoreResult<()>;

    /// Short label used in logs and metrics
    fn name(&self) -> &'static str;
}
