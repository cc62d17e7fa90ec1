use axum::http::StatusCode;
use thiserror::Error;

/// Which level of the governance hierarchy produced a denial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    ProviderConfig,
    VirtualKey,
    Team,
    Customer,
}

impl std::fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QuotaScope::ProviderConfig => "provider-config",
            QuotaScope::VirtualKey => "vk",
            QuotaScope::Team => "team",
            QuotaScope::Customer => "customer",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateDimension {
    Requests,
    Tokens,
}

impl std::fmt::Display for RateDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateDimension::Requests => f.write_str("request"),
            RateDimension::Tokens => f.write_str("token"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("unsupported operation: {operation}")]
    UnsupportedOperation { operation: String },
    #[error("unknown model: {model}")]
    UnknownModel { model: String },
    #[error("unauthorized virtual key")]
    Unauthorized,
    #[error("session expired")]
    SessionExpired,
    #[error("budget exceeded at {scope} scope: limit={limit} usage={usage}")]
    BudgetExceeded {
        scope: QuotaScope,
        limit: f64,
        usage: f64,
    },
    #[error("{dimension} rate limit exceeded at {scope} scope: limit={limit} usage={usage}")]
    RateLimited {
        scope: QuotaScope,
        dimension: RateDimension,
        limit: u64,
        usage: u64,
        retry_after_seconds: Option<u64>,
    },
    #[error("{kind} not found: {id}")]
    EntityNotFound { kind: String, id: String },
    #[error("no {provider} key serves model {model}")]
    NoKeyForModel { provider: String, model: String },
    #[error("provider not registered: {provider}")]
    ProviderNotFound { provider: String },
    #[error("request dropped: {provider} queue full")]
    Dropped { provider: String },
    #[error("upstream connection failed: {message}")]
    UpstreamConnect { message: String },
    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },
    #[error("upstream call timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Transient upstream failures advance the fallback iterator; everything
    /// else short-circuits the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::UpstreamConnect { .. } | GatewayError::Timeout { .. } => true,
            GatewayError::Upstream { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest { .. }
            | GatewayError::UnsupportedOperation { .. }
            | GatewayError::UnknownModel { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized | GatewayError::SessionExpired => StatusCode::UNAUTHORIZED,
            GatewayError::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::EntityNotFound { .. }
            | GatewayError::NoKeyForModel { .. }
            | GatewayError::ProviderNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Dropped { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamConnect { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The OpenAI-style `error.type` discriminator surfaced to clients.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. }
            | GatewayError::UnsupportedOperation { .. }
            | GatewayError::UnknownModel { .. } => "invalid_request_error",
            GatewayError::Unauthorized | GatewayError::SessionExpired => "authentication_error",
            GatewayError::BudgetExceeded { .. } => "budget_exceeded_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Internal(_) => "api_error",
            _ => "upstream_error",
        }
    }

    /// Seconds the client should wait before retrying, when known.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return GatewayError::Timeout { seconds: 0 };
        }
        GatewayError::UpstreamConnect {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidResponse(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::UpstreamConnect {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
