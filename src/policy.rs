use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    bucket::{saturating_secs, BucketParams, MAX_REFILL_PERIOD},
    config::{GatewayConfig, ServiceConfig},
    error::{GatewayError, Result},
};

/// Limiting algorithm applied to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
}

/// What the engine does when the shared store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPolicy {
    /// Reject with `StoreUnavailable`
    #[default]
    FailClosed,
    /// Admit and raise a degradation signal
    FailOpen,
    /// Enforce the limit per gateway instance with in-process state.
    /// The aggregate bound becomes `capacity * instances`.
    LocalFallback,
}

impl DegradationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationPolicy::FailClosed => "fail_closed",
            DegradationPolicy::FailOpen => "fail_open",
            DegradationPolicy::LocalFallback => "local_fallback",
        }
    }
}

/// Limiting policy of one service
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub service: String,
    pub capacity: u64,
    pub window: Duration,
    /// Tokens per second
    pub refill_rate: f64,
    pub algorithm: Algorithm,
    pub degradation: DegradationPolicy,
}

impl Policy {
    pub fn from_service_config(service: &ServiceConfig, default_degradation: DegradationPolicy) -> Self {
        Self {
            service: service.name.clone(),
            capacity: service.capacity,
            window: Duration::from_secs(service.window_secs),
            refill_rate: service.effective_refill_rate(),
            algorithm: service.algorithm,
            degradation: service.degradation.unwrap_or(default_degradation),
        }
    }

    /// How long idle state must be kept. Never shorter than a full refill,
    /// so a dropped bucket is indistinguishable from a replenished one.
    /// Saturates at `MAX_REFILL_PERIOD`, which validation keeps above any
    /// accepted refill time.
    pub fn state_ttl(&self) -> Duration {
        let full_refill = if self.refill_rate > 0.0 {
            saturating_secs(self.capacity as f64 / self.refill_rate)
        } else {
            self.window
        };
        self.window.max(full_refill).min(MAX_REFILL_PERIOD)
    }

    pub fn bucket_params(&self) -> BucketParams {
        BucketParams {
            capacity: self.capacity as f64,
            refill_rate: self.refill_rate,
            ttl: self.state_ttl(),
        }
    }
}

type PolicyMap = HashMap<String, Arc<Policy>>;

/// Read-mostly map of service name to policy.
///
/// Readers always see one whole snapshot; `replace` swaps the entire map.
pub struct PolicyRegistry {
    policies: ArcSwap<PolicyMap>,
}

impl PolicyRegistry {
    pub fn new(policies: impl IntoIterator<Item = Policy>) -> Self {
        Self {
            policies: ArcSwap::from_pointee(Self::index(policies)),
        }
    }

    /// Build the registry from a validated configuration
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(Self::policies_from_config(config)))
    }

    pub fn policies_from_config(config: &GatewayConfig) -> Vec<Policy> {
        config
            .services
            .iter()
            .map(|s| Policy::from_service_config(s, config.default_degradation))
            .collect()
    }

    fn index(policies: impl IntoIterator<Item = Policy>) -> PolicyMap {
        policies
            .into_iter()
            .map(|p| (p.service.clone(), Arc::new(p)))
            .collect()
    }

    /// Get the policy for a service
    pub fn get(&self, service: &str) -> Result<Arc<Policy>> {
        self.policies
            .load()
            .get(service)
            .cloned()
            .ok_or_else(|| GatewayError::PolicyNotFound(service.to_string()))
    }

    /// Current snapshot of every policy
    pub fn snapshot(&self) -> Arc<PolicyMap> {
        self.policies.load_full()
    }

    /// Atomically replace the whole policy set
    pub fn replace(&self, policies: impl IntoIterator<Item = Policy>) {
        self.policies.store(Arc::new(Self::index(policies)));
    }

    pub fn contains(&self, service: &str) -> bool {
        self.policies.load().contains_key(service)
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
