use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    config::{ClientIdentityConfig, ClientIdentityStrategy, GatewayConfig},
    error::{GatewayError, Result},
    limiter::{AdmissionEngine, Decision},
    local::LocalStore,
    metrics::Metrics,
    policy::PolicyRegistry,
    proxy::ProxyDispatcher,
    redis::RedisStore,
    router::Router,
    store::RateLimitStore,
    utils::{retry_after_secs, Clock, SystemClock},
};

/// Client key used when no per-client identity can be derived
pub const ANONYMOUS_CLIENT: &str = "anonymous";
const GLOBAL_CLIENT: &str = "global";

/// Per-request pipeline: route, admit, forward.
pub struct GatewayService {
    router: Router,
    engine: Arc<AdmissionEngine>,
    proxy: ProxyDispatcher,
    client_identity: ClientIdentityConfig,
    metrics: Arc<Metrics>,
}

impl GatewayService {
    pub fn new(
        router: Router,
        engine: Arc<AdmissionEngine>,
        proxy: ProxyDispatcher,
        client_identity: ClientIdentityConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        for service in router.services() {
            if !engine.registry().contains(service) {
                return Err(GatewayError::PolicyNotFound(service.to_string()));
            }
        }

        Ok(Self {
            router,
            engine,
            proxy,
            client_identity,
            metrics,
        })
    }

    /// Build the whole pipeline from configuration. An unreachable Redis is
    /// not fatal: requests go through each service's degradation policy
    /// until it answers.
    pub async fn from_config(config: &GatewayConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let (store, key_prefix) = match &config.redis {
            Some(redis) => {
                let redis_store = RedisStore::new(redis)?;
                if let Err(e) = redis_store.health_check().await {
                    warn!("Redis unreachable at startup ({}), degradation policies apply", e);
                }
                let store: Arc<dyn RateLimitStore> = Arc::new(redis_store);
                (store, redis.key_prefix.clone())
            }
            None => {
                info!("No Redis configured, limits are enforced per instance");
                let store: Arc<dyn RateLimitStore> =
                    Arc::new(LocalStore::new(config.local_cache_capacity));
                (store, String::new())
            }
        };

        Self::with_store(config, store, key_prefix, Arc::new(SystemClock::new()), metrics)
    }

    /// Build the pipeline around an existing store and clock
    pub fn with_store(
        config: &GatewayConfig,
        store: Arc<dyn RateLimitStore>,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let registry = Arc::new(PolicyRegistry::from_config(config)?);
        let engine = Arc::new(AdmissionEngine::new(
            registry,
            store,
            Arc::new(LocalStore::new(config.local_cache_capacity)),
            clock,
            metrics.clone(),
            key_prefix,
        ));
        let router = Router::from_config(config)?;
        let proxy = ProxyDispatcher::new(Duration::from_millis(config.upstream_timeout_ms));

        Self::new(router, engine, proxy, config.client_identity.clone(), metrics)
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Swap in the policies of `config`. Routes are fixed at startup, so the
    /// new set must still cover every routed service.
    pub fn reload_policies(&self, config: &GatewayConfig) -> Result<()> {
        config.validate()?;
        let policies = PolicyRegistry::policies_from_config(config);

        for service in self.router.services() {
            if !policies.iter().any(|p| p.service == service) {
                return Err(GatewayError::PolicyNotFound(service.to_string()));
            }
        }

        self.engine.registry().replace(policies);
        self.metrics.record_policy_reload();
        info!("Reloaded policies for {} services", self.engine.registry().len());
        Ok(())
    }

    /// Derive the client half of the rate key
    pub fn client_identity(&self, request: &Request) -> String {
        match self.client_identity.strategy {
            ClientIdentityStrategy::Global => GLOBAL_CLIENT.to_string(),
            ClientIdentityStrategy::Ip => request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
                .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string()),
            ClientIdentityStrategy::Header => self
                .client_identity
                .header
                .as_deref()
                .and_then(|name| request.headers().get(name))
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string()),
        }
    }

    /// Handle one proxied request end to end
    pub async fn handle(&self, request: Request) -> Response {
        let _timer = self.metrics.start_request_timer();

        let path = request.uri().path().to_string();
        let route = match self.router.resolve(&path) {
            Ok(route) => route,
            Err(e) => {
                self.metrics.record_request("none", e.reason());
                return error_response(None, &e);
            }
        };
        let service = route.service.as_str();
        let client = self.client_identity(&request);

        let decision = match self
            .engine
            .decide_detached(service.to_string(), client, 1)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                if matches!(e, GatewayError::PolicyNotFound(_)) {
                    warn!("Routed service {} has no policy", service);
                }
                self.metrics.record_request(service, e.reason());
                return error_response(Some(service), &e);
            }
        };

        if !decision.admitted {
            self.metrics.record_request(service, "rate_limited");
            return rate_limited_response(service, &decision);
        }

        match self.proxy.forward(request, &route.upstream, self.proxy.timeout()).await {
            Ok(mut response) => {
                self.metrics.record_request(service, "admitted");
                add_rate_limit_headers(&mut response, &decision);
                response
            }
            Err(e) => {
                warn!("Upstream call for service {} failed: {}", service, e);
                self.metrics.record_upstream_error(service, e.kind.as_str());
                let e = GatewayError::Upstream(e);
                self.metrics.record_request(service, e.reason());
                error_response(Some(service), &e)
            }
        }
    }
}

fn add_rate_limit_headers(response: &mut Response, decision: &Decision) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
}

/// 429 with a `Retry-After` hint and a body naming the limited service
pub fn rate_limited_response(service: &str, decision: &Decision) -> Response {
    let retry_after = decision.retry_after.map(retry_after_secs);
    let body = json!({
        "error": "rate_limited",
        "service": service,
        "retry_after_secs": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    add_rate_limit_headers(&mut response, decision);
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

/// JSON error body carrying the machine-readable reason
pub fn error_response(service: Option<&str>, error: &GatewayError) -> Response {
    let body = json!({
        "error": error.reason(),
        "service": service,
        "message": error.to_string(),
    });
    (error.status_code(), Json(body)).into_response()
}

/// Full HTTP surface: health, metrics and the proxied fallback
pub fn app(service: Arc<GatewayService>) -> axum::Router {
    axum::Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .fallback(gateway_handler)
        .with_state(service)
}

async fn gateway_handler(State(service): State<Arc<GatewayService>>, request: Request) -> Response {
    service.handle(request).await
}

async fn health_check(State(service): State<Arc<GatewayService>>) -> Response {
    let store = service.engine.store_name();
    match service.engine.health_check().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "store": store,
            "timestamp": SystemClock::new().utc_now().to_rfc3339()
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "store": store,
                "error": e.to_string(),
                "timestamp": SystemClock::new().utc_now().to_rfc3339()
            })),
        )
            .into_response(),
    }
}

async fn metrics_handler(State(service): State<Arc<GatewayService>>) -> std::result::Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = service.metrics.registry().gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
