//! Inbound HTTP surface: the OpenAI-compatible client API and the governance
//! control plane.

pub mod admin;
pub mod chat;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use serde_json::json;

use crate::error::GatewayError;
use crate::governance::Governance;
use crate::pipeline::Gateway;
use crate::session::SessionManager;
use crate::utils::pool::BufferPool;

#[derive(Clone)]
pub struct GatewayHttpState {
    pub(crate) gateway: Arc<Gateway>,
    pub(crate) governance: Arc<Governance>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) admin_token: Option<String>,
    pub(crate) sse_buffers: Arc<BufferPool>,
}

impl GatewayHttpState {
    pub fn new(
        gateway: Arc<Gateway>,
        governance: Arc<Governance>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            gateway,
            governance,
            sessions,
            admin_token: None,
            sse_buffers: Arc::new(BufferPool::new(16, 1024)),
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    /// Admin routes accept the static bearer token or a live dashboard
    /// session.
    pub(crate) async fn authorize_admin(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        let Some(token) = bearer_token(headers) else {
            return Err(GatewayError::Unauthorized);
        };
        if let Some(admin_token) = &self.admin_token {
            if token == *admin_token {
                return Ok(());
            }
        }
        self.sessions.validate(&token).await.map(|_| ())
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/responses", post(chat::responses))
        .route("/v1/{*rest}", any(chat::unsupported))
        .route("/api/login", post(admin::login))
        .route("/api/governance/data", get(admin::governance_data))
        .route("/api/governance/customers", post(admin::create_customer))
        .route(
            "/api/governance/customers/{id}",
            put(admin::update_customer).delete(admin::delete_customer),
        )
        .route("/api/governance/teams", post(admin::create_team))
        .route(
            "/api/governance/teams/{id}",
            put(admin::update_team).delete(admin::delete_team),
        )
        .route("/api/governance/virtual-keys", post(admin::create_virtual_key))
        .route(
            "/api/governance/virtual-keys/{id}",
            put(admin::update_virtual_key).delete(admin::delete_virtual_key),
        )
        .route("/api/governance/budgets/{id}", put(admin::update_budget))
        .route(
            "/api/governance/rate-limits/{id}",
            put(admin::update_rate_limit),
        )
        .with_state(state)
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// The client-presented virtual key: `Authorization: Bearer <vk>` or
/// `x-api-key: <vk>`.
pub(crate) fn client_virtual_key(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = bearer_token(headers) {
        return Some(token);
    }
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// OpenAI-style error envelope; 429s carry a Retry-After hint, governance
/// denials carry the scope that fired.
pub(crate) fn error_response(err: &GatewayError) -> Response {
    let mut error = json!({
        "message": err.to_string(),
        "type": err.error_type(),
    });
    match err {
        GatewayError::RateLimited { scope, dimension, .. } => {
            error["scope"] = json!(scope);
            error["dimension"] = json!(dimension);
        }
        GatewayError::BudgetExceeded { scope, .. } => {
            error["scope"] = json!(scope);
        }
        _ => {}
    }

    let mut response =
        (err.status_code(), axum::Json(json!({ "error": error }))).into_response();
    if let Some(retry_after) = err.retry_after_seconds() {
        if let Ok(value) = retry_after.to_string().parse() {
            response.headers_mut().insert("retry-after", value);
        }
    }
    response
}
