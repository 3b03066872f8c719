use std::fmt;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur while admitting and forwarding a request
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No policy configured for service: {0}")]
    PolicyNotFound(String),

    #[error("No route for path: {0}")]
    NoRoute(String),

    #[error("Rate limit store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl GatewayError {
    /// Machine-readable reason carried in rejection bodies
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::PolicyNotFound(_) => "policy_not_found",
            GatewayError::NoRoute(_) => "no_route",
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::Upstream(e) if e.kind == UpstreamErrorKind::Timeout => "upstream_timeout",
            GatewayError::Upstream(_) => "upstream_unavailable",
            GatewayError::InvalidRequest(_) => "invalid_request",
            _ => "internal_error",
        }
    }

    /// HTTP status the front end answers with
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoRoute(_) => StatusCode::NOT_FOUND,
            GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(e) if e.kind == UpstreamErrorKind::Timeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failure kinds on the forwarding path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Timeout,
    ConnectionRefused,
    ProtocolError,
}

impl UpstreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamErrorKind::Timeout => "timeout",
            UpstreamErrorKind::ConnectionRefused => "connection_refused",
            UpstreamErrorKind::ProtocolError => "protocol_error",
        }
    }
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors raised by a rate limit store backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("store command timed out after {0}ms")]
    Timeout(u64),

    #[error("unexpected store response: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.kind() == redis::ErrorKind::TypeError {
            StoreError::Protocol(e.to_string())
        } else {
            StoreError::Unavailable(e.to_string())
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::StoreUnavailable(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
