use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    time::{Duration, Instant},
};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{
    bucket::{BucketParams, ConsumeOutcome},
    error::{GatewayError, Result, StoreError, StoreResult},
    store::RateLimitStore,
};

/// Refill, test and debit one bucket server-side.
///
/// KEYS[1] bucket hash {tokens, ts}
/// ARGV capacity, refill rate (tokens/s), cost, now (ms), ttl (ms)
/// Returns {admitted, tokens} with tokens as a string to keep the fraction.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local elapsed = now - ts
if elapsed < 0 then
  elapsed = 0
end
tokens = math.min(capacity, tokens + (elapsed / 1000) * refill_rate)
if now > ts then
  ts = now
end

local admitted = 0
if tokens >= cost then
  tokens = tokens - cost
  admitted = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(ts))
redis.call('PEXPIRE', key, ttl)
return {admitted, tostring(tokens)}
"#;

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_key_prefix() -> String {
    "gateway".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

fn default_command_timeout_ms() -> u64 {
    250
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: default_key_prefix(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// How long a failed connection attempt is remembered before the next one
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Shared bucket store backed by Redis.
///
/// Atomicity comes from running the whole check-and-consume as one Lua
/// script, so any number of gateway instances can share the same keys.
///
/// The connection is established on first use. Until it succeeds every
/// operation fails with `StoreError` and callers apply their degradation
/// policy; once up, the `ConnectionManager` reconnects on its own.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    last_failure: Mutex<Option<Instant>>,
    script: Script,
    connection_timeout: Duration,
    command_timeout: Duration,
}

impl RedisStore {
    /// Create the store without touching the network. Only a malformed URL
    /// is an error here.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            GatewayError::Redis(e)
        })?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            last_failure: Mutex::new(None),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            connection_timeout: config.connection_timeout(),
            command_timeout: config.command_timeout(),
        })
    }

    /// Connect and verify the server answers PING
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let store = Self::new(config)?;
        store.health_check().await?;
        info!("Redis store initialized successfully");
        Ok(store)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }

        if let Some(failed_at) = *self.last_failure.lock() {
            if failed_at.elapsed() < RECONNECT_BACKOFF {
                return Err(StoreError::Unavailable("Redis connection not established".to_string()));
            }
        }

        let result = self
            .connection
            .get_or_try_init(|| async {
                match tokio::time::timeout(self.connection_timeout, self.client.get_connection_manager())
                    .await
                {
                    Ok(Ok(conn)) => {
                        info!("Redis connection manager created");
                        Ok(conn)
                    }
                    Ok(Err(e)) => {
                        warn!("Failed to create connection manager: {}", e);
                        Err(StoreError::from(e))
                    }
                    Err(_) => {
                        warn!(
                            "Timeout while creating connection manager ({}ms)",
                            self.connection_timeout.as_millis()
                        );
                        Err(StoreError::Timeout(self.connection_timeout.as_millis() as u64))
                    }
                }
            })
            .await;

        match result {
            Ok(conn) => Ok(conn.clone()),
            Err(e) => {
                *self.last_failure.lock() = Some(Instant::now());
                Err(e)
            }
        }
    }

    /// Bound a command by the configured timeout
    async fn bounded<T>(
        &self,
        command: impl Future<Output = redis::RedisResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.command_timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn check_and_consume(
        &self,
        key: &str,
        params: &BucketParams,
        cost: u64,
        now: Duration,
    ) -> StoreResult<ConsumeOutcome> {
        let mut conn = self.connection().await?;
        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(key)
            .arg(params.capacity)
            .arg(params.refill_rate)
            .arg(cost)
            .arg(now.as_millis() as u64)
            .arg(params.ttl.as_millis().max(1) as u64);

        let (admitted, tokens): (i64, String) =
            self.bounded(invocation.invoke_async(&mut conn)).await?;

        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| StoreError::Protocol(format!("bad token count {:?}: {}", tokens, e)))?;

        Ok(ConsumeOutcome {
            tokens,
            admitted: admitted == 1,
        })
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = self.bounded(conn.del(key)).await?;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        self.bounded(redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketState;
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    #[test]
    fn test_redis_config_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.key_prefix, "gateway");
        assert_eq!(config.command_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_redis_config_from_yaml() {
        let config: RedisConfig = serde_yaml::from_str("url: redis://cache:6380\ncommand_timeout_ms: 50\n").unwrap();
        assert_eq!(config.url, "redis://cache:6380");
        assert_eq!(config.command_timeout(), Duration::from_millis(50));
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_malformed_url_is_rejected() {
        let config = RedisConfig {
            url: "not a redis url".into(),
            ..Default::default()
        };
        assert!(matches!(RedisStore::new(&config), Err(GatewayError::Redis(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_operations_not_construction() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".into(),
            connection_timeout_ms: 500,
            ..Default::default()
        };
        let store = RedisStore::new(&config).unwrap();
        let params = BucketParams {
            capacity: 2.0,
            refill_rate: 1.0,
            ttl: Duration::from_secs(5),
        };

        for _ in 0..3 {
            let result = store
                .check_and_consume("gateway:a:x", &params, 1, Duration::from_secs(1))
                .await;
            assert!(result.is_err());
        }
        assert!(store.health_check().await.is_err());
        assert!(!store.is_connected());
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into())
    }

    async fn connect() -> RedisStore {
        RedisStore::connect(&RedisConfig {
            url: redis_url(),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    // The tests below need a reachable Redis:
    // REDIS_URL=redis://localhost:6379 cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_script_against_redis() {
        let store = connect().await;

        let key = format!("gateway-test:{}", std::process::id());
        let params = BucketParams {
            capacity: 2.0,
            refill_rate: 1.0,
            ttl: Duration::from_secs(5),
        };
        let now = Duration::from_secs(1_000);
        store.reset(&key).await.unwrap();

        assert!(store.check_and_consume(&key, &params, 1, now).await.unwrap().admitted);
        assert!(store.check_and_consume(&key, &params, 1, now).await.unwrap().admitted);
        let third = store.check_and_consume(&key, &params, 1, now).await.unwrap();
        assert!(!third.admitted);
        assert_eq!(third.tokens, 0.0);

        let later = store
            .check_and_consume(&key, &params, 1, now + Duration::from_millis(1_500))
            .await
            .unwrap();
        assert!(later.admitted);
        assert!((later.tokens - 0.5).abs() < 1e-9);

        store.reset(&key).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    #[ignore]
    async fn test_script_is_atomic_across_instances() {
        let first = Arc::new(connect().await);
        let second = Arc::new(connect().await);

        let key = format!("gateway-test:burst:{}", std::process::id());
        let params = BucketParams {
            capacity: 10.0,
            refill_rate: 0.001,
            ttl: Duration::from_secs(30),
        };
        let now = Duration::from_secs(2_000);
        first.reset(&key).await.unwrap();

        let admitted = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let store = if i % 2 == 0 { first.clone() } else { second.clone() };
                let key = key.clone();
                let admitted = admitted.clone();
                tokio::spawn(async move {
                    let outcome = store.check_and_consume(&key, &params, 1, now).await.unwrap();
                    if outcome.admitted {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 10);
        first.reset(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_script_matches_local_arithmetic() {
        let store = connect().await;
        let key = format!("gateway-test:refill:{}", std::process::id());
        let params = BucketParams {
            capacity: 10.0,
            refill_rate: 2.0,
            ttl: Duration::from_secs(30),
        };
        store.reset(&key).await.unwrap();

        let start = Duration::from_secs(3_000);
        let mut local = BucketState::full(&params, start);
        let steps = [
            (0, 7),
            (0, 4),
            (1_500, 2),
            (250, 1),
            (3_600_000, 1),
            (0, 10),
        ];

        let mut now = start;
        for (advance_ms, cost) in steps {
            now += Duration::from_millis(advance_ms);
            let remote = store.check_and_consume(&key, &params, cost, now).await.unwrap();
            let expected = local.consume(&params, cost, now);
            assert_eq!(remote.admitted, expected.admitted, "at {:?} cost {}", now, cost);
            assert!((remote.tokens - expected.tokens).abs() < 1e-9);
        }

        store.reset(&key).await.unwrap();
    }
}
