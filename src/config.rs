use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{
    bucket::MAX_REFILL_PERIOD,
    error::{GatewayError, Result},
    policy::{Algorithm, DegradationPolicy},
    redis::RedisConfig,
};

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Shared store; absent means every instance limits with local state only
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub client_identity: ClientIdentityConfig,
    #[serde(default)]
    pub default_degradation: DegradationPolicy,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    #[serde(default = "default_local_cache_capacity")]
    pub local_cache_capacity: u64,
    pub services: Vec<ServiceConfig>,
}

/// One backend service behind the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub path_prefix: String,
    pub upstream: String,
    pub capacity: u64,
    pub window_secs: u64,
    /// Tokens per second; defaults to `capacity / window_secs`
    #[serde(default)]
    pub refill_rate: Option<f64>,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub degradation: Option<DegradationPolicy>,
}

impl ServiceConfig {
    pub fn effective_refill_rate(&self) -> f64 {
        self.refill_rate
            .unwrap_or(self.capacity as f64 / self.window_secs.max(1) as f64)
    }
}

/// How the client half of a rate key is derived. One strategy applies to
/// every service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientIdentityConfig {
    #[serde(default)]
    pub strategy: ClientIdentityStrategy,
    /// Header carrying the client key when `strategy` is `header`
    #[serde(default)]
    pub header: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientIdentityStrategy {
    /// One bucket per service shared by all callers
    Global,
    /// Peer IP address
    #[default]
    Ip,
    /// Value of a request header such as an API key
    Header,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    30_000
}

fn default_local_cache_capacity() -> u64 {
    100_000
}

impl GatewayConfig {
    /// Reject configurations that would let a request reach an unmetered
    /// or undefined service
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(GatewayError::Config("at least one service is required".into()));
        }

        if self.upstream_timeout_ms == 0 {
            return Err(GatewayError::Config("upstream_timeout_ms must be positive".into()));
        }

        if self.client_identity.strategy == ClientIdentityStrategy::Header
            && self.client_identity.header.as_deref().map_or(true, str::is_empty)
        {
            return Err(GatewayError::Config(
                "client_identity.header is required for the header strategy".into(),
            ));
        }

        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();

        for service in &self.services {
            let name = &service.name;
            if name.is_empty() {
                return Err(GatewayError::Config("service name must not be empty".into()));
            }
            if !names.insert(name.as_str()) {
                return Err(GatewayError::Config(format!("duplicate service: {}", name)));
            }
            if !service.path_prefix.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "service {}: path_prefix must start with '/'",
                    name
                )));
            }
            if !prefixes.insert(crate::router::normalize_prefix(&service.path_prefix)) {
                return Err(GatewayError::Config(format!(
                    "service {}: duplicate path_prefix {}",
                    name, service.path_prefix
                )));
            }
            if service.capacity == 0 {
                return Err(GatewayError::Config(format!("service {}: capacity must be positive", name)));
            }
            if service.window_secs == 0 {
                return Err(GatewayError::Config(format!("service {}: window_secs must be positive", name)));
            }
            if service.window_secs > MAX_REFILL_PERIOD.as_secs() {
                return Err(GatewayError::Config(format!(
                    "service {}: window_secs must not exceed {}",
                    name,
                    MAX_REFILL_PERIOD.as_secs()
                )));
            }
            let rate = service.effective_refill_rate();
            if !rate.is_finite() || rate <= 0.0 {
                return Err(GatewayError::Config(format!(
                    "service {}: refill_rate must be a positive number",
                    name
                )));
            }
            if service.capacity as f64 / rate > MAX_REFILL_PERIOD.as_secs_f64() {
                return Err(GatewayError::Config(format!(
                    "service {}: refill_rate {} takes longer than {}s to refill capacity {}",
                    name,
                    rate,
                    MAX_REFILL_PERIOD.as_secs(),
                    service.capacity
                )));
            }
            match reqwest::Url::parse(&service.upstream) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(url) => {
                    return Err(GatewayError::Config(format!(
                        "service {}: unsupported upstream scheme {}",
                        name,
                        url.scheme()
                    )))
                }
                Err(e) => {
                    return Err(GatewayError::Config(format!(
                        "service {}: invalid upstream {}: {}",
                        name, service.upstream, e
                    )))
                }
            }
        }

        Ok(())
    }
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<GatewayConfig> {
    serde_yaml::from_str(yaml)
        .map_err(|e| GatewayError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Load configuration from a YAML file, letting `GATEWAY__*` environment
/// variables override individual values (e.g. `GATEWAY__REDIS__URL`)
pub fn load_config_from_file(path: &str) -> Result<GatewayConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::new(path, config::FileFormat::Yaml))
        .add_source(
            config::Environment::with_prefix("GATEWAY")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| GatewayError::Config(format!("Failed to read {}: {}", path, e)))?;

    settings
        .try_deserialize()
        .map_err(|e| GatewayError::Config(format!("Failed to parse {}: {}", path, e)))
}
