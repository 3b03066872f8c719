use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    bucket::{self, ConsumeOutcome},
    error::{GatewayError, Result, StoreError},
    local::LocalStore,
    metrics::Metrics,
    policy::{DegradationPolicy, Policy, PolicyRegistry},
    store::RateLimitStore,
    utils::{generate_rate_key, Clock},
};

/// Where an admission decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// The configured store answered
    Store,
    /// The store failed and this instance's local bucket decided
    LocalFallback,
    /// The store failed and the request was let through unmetered
    FailOpen,
}

impl DecisionSource {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, DecisionSource::Store)
    }
}

/// Verdict for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub admitted: bool,
    /// Time until the request would fit; `None` when admitted or when the
    /// cost exceeds the bucket capacity
    pub retry_after: Option<Duration>,
    pub remaining: u64,
    pub limit: u64,
    pub source: DecisionSource,
}

impl Decision {
    fn from_outcome(policy: &Policy, cost: u64, outcome: ConsumeOutcome, source: DecisionSource) -> Self {
        let retry_after = if outcome.admitted {
            None
        } else {
            bucket::retry_after(&policy.bucket_params(), cost, outcome.tokens)
        };

        Self {
            admitted: outcome.admitted,
            retry_after,
            remaining: outcome.tokens.max(0.0).floor() as u64,
            limit: policy.capacity,
            source,
        }
    }

    fn fail_open(policy: &Policy) -> Self {
        Self {
            admitted: true,
            retry_after: None,
            remaining: policy.capacity,
            limit: policy.capacity,
            source: DecisionSource::FailOpen,
        }
    }
}

/// Decides per request whether a (service, client) pair still has quota.
///
/// The engine keeps no bucket state of its own: every call goes to the store,
/// which performs refill, check and debit in one atomic step.
pub struct AdmissionEngine {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn RateLimitStore>,
    fallback: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    key_prefix: String,
}

impl AdmissionEngine {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        store: Arc<dyn RateLimitStore>,
        fallback: Arc<LocalStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            fallback,
            clock,
            metrics,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Admit or reject one request of weight `cost`
    pub async fn decide(&self, service: &str, client: &str, cost: u64) -> Result<Decision> {
        if cost == 0 {
            return Err(GatewayError::InvalidRequest("cost must be positive".to_string()));
        }

        let policy = self.registry.get(service)?;
        let key = generate_rate_key(&self.key_prefix, service, client);
        let params = policy.bucket_params();
        let now = self.clock.now();

        let started = Instant::now();
        let result = self.store.check_and_consume(&key, &params, cost, now).await;
        self.metrics
            .record_store_operation_duration("check_and_consume", started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                self.metrics.record_store_operation("check_and_consume", "success");
                let decision = Decision::from_outcome(&policy, cost, outcome, DecisionSource::Store);
                if !decision.admitted {
                    debug!(
                        "Rejected {} for service {}: retry after {:?}",
                        client, service, decision.retry_after
                    );
                }
                Ok(decision)
            }
            Err(e) => {
                self.metrics.record_store_operation("check_and_consume", "error");
                self.degrade(&policy, &key, cost, now, e).await
            }
        }
    }

    /// Run `decide` on its own task so the quota update completes even if
    /// the caller goes away
    pub async fn decide_detached(
        self: &Arc<Self>,
        service: String,
        client: String,
        cost: u64,
    ) -> Result<Decision> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.decide(&service, &client, cost).await })
            .await
            .map_err(|e| GatewayError::Internal(format!("admission task failed: {}", e)))?
    }

    async fn degrade(
        &self,
        policy: &Policy,
        key: &str,
        cost: u64,
        now: Duration,
        error: StoreError,
    ) -> Result<Decision> {
        let mode = policy.degradation;
        warn!(
            "Rate limit store {} failed for service {} ({}), applying {}",
            self.store.name(),
            policy.service,
            error,
            mode.as_str()
        );
        self.metrics.record_degraded_decision(&policy.service, mode.as_str());

        match mode {
            DegradationPolicy::FailClosed => Err(GatewayError::from(error)),
            DegradationPolicy::FailOpen => Ok(Decision::fail_open(policy)),
            DegradationPolicy::LocalFallback => {
                let outcome = self
                    .fallback
                    .check_and_consume(key, &policy.bucket_params(), cost, now)
                    .await?;
                Ok(Decision::from_outcome(policy, cost, outcome, DecisionSource::LocalFallback))
            }
        }
    }

    /// Return a (service, client) bucket to full capacity
    pub async fn reset(&self, service: &str, client: &str) -> Result<()> {
        self.registry.get(service)?;
        let key = generate_rate_key(&self.key_prefix, service, client);
        self.store.reset(&key).await?;
        self.fallback.reset(&key).await?;
        Ok(())
    }

    /// Health check for the backing store
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await?;
        Ok(())
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bucket::BucketParams,
        error::StoreResult,
        policy::Algorithm,
        utils::ManualClock,
    };
    use async_trait::async_trait;

    struct DownStore;

    #[async_trait]
    impl RateLimitStore for DownStore {
        async fn check_and_consume(
            &self,
            _key: &str,
            _params: &BucketParams,
            _cost: u64,
            _now: Duration,
        ) -> StoreResult<ConsumeOutcome> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn reset(&self, _key: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn health_check(&self) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn policy(service: &str, capacity: u64, degradation: DegradationPolicy) -> Policy {
        Policy {
            service: service.to_string(),
            capacity,
            window: Duration::from_secs(60),
            refill_rate: capacity as f64 / 60.0,
            algorithm: Algorithm::TokenBucket,
            degradation,
        }
    }

    fn engine(store: Arc<dyn RateLimitStore>, policies: Vec<Policy>) -> (AdmissionEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));
        let engine = AdmissionEngine::new(
            Arc::new(PolicyRegistry::new(policies)),
            store,
            Arc::new(LocalStore::default()),
            clock.clone(),
            Arc::new(Metrics::new().unwrap()),
            "test",
        );
        (engine, clock)
    }

    #[tokio::test]
    async fn test_remaining_counts_down_then_rejects() {
        let (engine, _) = engine(
            Arc::new(LocalStore::default()),
            vec![policy("a", 5, DegradationPolicy::FailClosed)],
        );

        for expected in [4, 3, 2, 1, 0] {
            let decision = engine.decide("a", "x", 1).await.unwrap();
            assert!(decision.admitted);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.source, DecisionSource::Store);
        }

        let rejected = engine.decide("a", "x", 1).await.unwrap();
        assert!(!rejected.admitted);
        assert_eq!(rejected.remaining, 0);
        let wait = rejected.retry_after.unwrap().as_secs_f64();
        assert!((wait - 12.0).abs() < 1e-6, "retry after {}", wait);
    }

    #[tokio::test]
    async fn test_refill_restores_capacity() {
        let (engine, clock) = engine(
            Arc::new(LocalStore::default()),
            vec![policy("a", 5, DegradationPolicy::FailClosed)],
        );

        for _ in 0..5 {
            engine.decide("a", "x", 1).await.unwrap();
        }
        assert!(!engine.decide("a", "x", 1).await.unwrap().admitted);

        // capacity / refill_rate = 60s, then wait far longer to check the cap
        clock.advance(Duration::from_secs(600));
        let decision = engine.decide("a", "x", 1).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_unknown_service_fails_closed() {
        let (engine, _) = engine(Arc::new(LocalStore::default()), vec![]);
        assert!(matches!(
            engine.decide("missing", "x", 1).await,
            Err(GatewayError::PolicyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_cost_is_invalid() {
        let (engine, _) = engine(
            Arc::new(LocalStore::default()),
            vec![policy("a", 5, DegradationPolicy::FailClosed)],
        );
        assert!(matches!(
            engine.decide("a", "x", 0).await,
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_cost_above_capacity_has_no_retry_hint() {
        let (engine, _) = engine(
            Arc::new(LocalStore::default()),
            vec![policy("a", 5, DegradationPolicy::FailClosed)],
        );
        let decision = engine.decide("a", "x", 6).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.retry_after, None);
        assert_eq!(decision.remaining, 5);
    }

    #[tokio::test]
    async fn test_degradation_modes() {
        let (engine, _) = engine(
            Arc::new(DownStore),
            vec![
                policy("closed", 2, DegradationPolicy::FailClosed),
                policy("open", 2, DegradationPolicy::FailOpen),
                policy("local", 2, DegradationPolicy::LocalFallback),
            ],
        );

        for _ in 0..3 {
            assert!(matches!(
                engine.decide("closed", "x", 1).await,
                Err(GatewayError::StoreUnavailable(_))
            ));

            let open = engine.decide("open", "x", 1).await.unwrap();
            assert!(open.admitted);
            assert_eq!(open.source, DecisionSource::FailOpen);
        }

        let local: Vec<bool> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                let d = engine.decide("local", "x", 1).await.unwrap();
                assert_eq!(d.source, DecisionSource::LocalFallback);
                out.push(d.admitted);
            }
            out
        };
        assert_eq!(local, vec![true, true, false]);

        assert_eq!(engine.metrics.degraded_decisions("open", "fail_open"), 3);
        assert_eq!(engine.metrics.degraded_decisions("closed", "fail_closed"), 3);
        assert!(engine.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_reset_restores_bucket() {
        let (engine, _) = engine(
            Arc::new(LocalStore::default()),
            vec![policy("a", 1, DegradationPolicy::FailClosed)],
        );

        assert!(engine.decide("a", "x", 1).await.unwrap().admitted);
        assert!(!engine.decide("a", "x", 1).await.unwrap().admitted);

        engine.reset("a", "x").await.unwrap();
        assert!(engine.decide("a", "x", 1).await.unwrap().admitted);
        assert!(matches!(engine.reset("b", "x").await, Err(GatewayError::PolicyNotFound(_))));
    }

    #[tokio::test]
    async fn test_decide_detached() {
        let (engine, _) = engine(
            Arc::new(LocalStore::default()),
            vec![policy("a", 1, DegradationPolicy::FailClosed)],
        );
        let engine = Arc::new(engine);

        let first = engine.decide_detached("a".into(), "x".into(), 1).await.unwrap();
        assert!(first.admitted);
        let second = engine.decide_detached("a".into(), "x".into(), 1).await.unwrap();
        assert!(!second.admitted);
    }

    /// Local store that takes a while before it touches the bucket
    struct SlowStore {
        inner: LocalStore,
        delay: Duration,
    }

    #[async_trait]
    impl RateLimitStore for SlowStore {
        async fn check_and_consume(
            &self,
            key: &str,
            params: &BucketParams,
            cost: u64,
            now: Duration,
        ) -> StoreResult<ConsumeOutcome> {
            tokio::time::sleep(self.delay).await;
            self.inner.check_and_consume(key, params, cost, now).await
        }

        async fn reset(&self, key: &str) -> StoreResult<()> {
            self.inner.reset(key).await
        }

        async fn health_check(&self) -> StoreResult<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_abandoned_decision_still_debits() {
        let store = Arc::new(SlowStore {
            inner: LocalStore::default(),
            delay: Duration::from_millis(100),
        });
        let (engine, _) = engine(store.clone(), vec![policy("a", 3, DegradationPolicy::FailClosed)]);
        let engine = Arc::new(engine);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            engine.decide_detached("a".into(), "x".into(), 1),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;

        let key = generate_rate_key("test", "a", "x");
        let state = store.inner.peek(&key).expect("bucket was written");
        assert_eq!(state.tokens, 2.0);

        let next = engine.decide("a", "x", 1).await.unwrap();
        assert_eq!(next.remaining, 1);
    }

    #[tokio::test]
    async fn test_tiny_refill_rate_does_not_fail_requests() {
        let mut slow_refill = policy("a", 1000, DegradationPolicy::FailClosed);
        slow_refill.refill_rate = 1e-17;
        let (engine, _) = engine(Arc::new(LocalStore::default()), vec![slow_refill]);
        let engine = Arc::new(engine);

        let first = engine.decide_detached("a".into(), "global".into(), 1000).await.unwrap();
        assert!(first.admitted);

        let rejected = engine.decide_detached("a".into(), "global".into(), 1).await.unwrap();
        assert!(!rejected.admitted);
        assert_eq!(rejected.retry_after, Some(bucket::MAX_REFILL_PERIOD));
    }
}
