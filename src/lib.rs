//! Rate-Limited API Gateway
//!
//! An HTTP gateway that proxies requests to backend services selected by
//! path prefix, enforcing an independent token-bucket quota per
//! (service, client) pair. Bucket state lives in Redis so several gateway
//! instances share one limit; an in-process store covers single-instance
//! deployments and degraded operation.
//!
//! Retries are not performed anywhere in this crate. A caller that retries a
//! POST is charged quota again and may repeat upstream side effects.

pub mod bucket;
pub mod config;
pub mod error;
pub mod limiter;
pub mod local;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod redis;
pub mod router;
pub mod service;
pub mod store;
pub mod utils;

// Re-export main types
pub use config::{GatewayConfig, ServiceConfig};
pub use error::{GatewayError, Result};
pub use limiter::{AdmissionEngine, Decision, DecisionSource};
pub use policy::{DegradationPolicy, Policy, PolicyRegistry};
pub use service::GatewayService;
pub use store::RateLimitStore;
