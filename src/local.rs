use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tracing::warn;

use crate::{
    bucket::{BucketParams, BucketState, ConsumeOutcome},
    error::{StoreError, StoreResult},
    store::RateLimitStore,
};

/// In-process bucket store.
///
/// Buckets live in a sharded map and are updated under the shard's write
/// lock, so refill, check and debit of one key never interleave. Entries are
/// only ever dropped once idle for their TTL; a key that cannot be stored is
/// refused instead of being served from a throwaway bucket.
///
/// State is private to this process: when several gateway instances fall
/// back to it, each enforces `capacity` on its own.
pub struct LocalStore {
    buckets: DashMap<String, LocalBucket>,
    max_keys: usize,
}

struct LocalBucket {
    state: BucketState,
    ttl: Duration,
    last_seen: Duration,
}

impl LocalBucket {
    fn idle(&self, now: Duration) -> bool {
        now.saturating_sub(self.last_seen) >= self.ttl
    }
}

impl LocalStore {
    pub fn new(max_keys: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            max_keys: usize::try_from(max_keys).unwrap_or(usize::MAX).max(1),
        }
    }

    /// Snapshot of the state held for `key`, if any
    pub fn peek(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|b| b.state)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets idle for at least their TTL. An idle bucket has refilled
    /// completely, so dropping it changes no decision.
    pub fn prune_idle(&self, now: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.idle(now));
        before.saturating_sub(self.buckets.len())
    }

    fn make_room(&self, key: &str, now: Duration) -> StoreResult<()> {
        if self.buckets.contains_key(key) || self.buckets.len() < self.max_keys {
            return Ok(());
        }

        self.prune_idle(now);
        if self.buckets.len() >= self.max_keys {
            warn!("Local bucket table full at {} keys, refusing {}", self.max_keys, key);
            return Err(StoreError::Unavailable(format!(
                "local bucket table full ({} keys)",
                self.max_keys
            )));
        }
        Ok(())
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl RateLimitStore for LocalStore {
    async fn check_and_consume(
        &self,
        key: &str,
        params: &BucketParams,
        cost: u64,
        now: Duration,
    ) -> StoreResult<ConsumeOutcome> {
        self.make_room(key, now)?;

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| LocalBucket {
                state: BucketState::full(params, now),
                ttl: params.ttl,
                last_seen: now,
            });

        // Policies may have been reloaded since the bucket was created
        bucket.ttl = params.ttl;
        bucket.last_seen = bucket.last_seen.max(now);
        Ok(bucket.state.consume(params, cost, now))
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        self.buckets.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
