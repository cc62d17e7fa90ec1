use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::governance::{
    BudgetSpec, CreateCustomerRequest, CreateTeamRequest, CreateVirtualKeyRequest, RateLimitSpec,
    UpdateCustomerRequest, UpdateTeamRequest, UpdateVirtualKeyRequest,
};

use super::{GatewayHttpState, error_response};

#[derive(Debug, Deserialize)]
pub(crate) struct LoginRequest {
    username: String,
    password: String,
}

pub(crate) async fn login(
    State(state): State<GatewayHttpState>,
    Json(request): Json<LoginRequest>,
) -> Response {
    match state.sessions.login(&request.username, &request.password).await {
        Ok(session) => Json(json!({
            "token": session.token,
            "expires_at": session.expires_at,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn governance_data(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    Json(json!({ "data": state.governance.dump() })).into_response()
}

pub(crate) async fn create_customer(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(request): Json<CreateCustomerRequest>,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.create_customer(request).await {
        Ok(customer) => {
            Json(json!({ "id": customer.id, "customer": customer })).into_response()
        }
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn update_customer(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateCustomerRequest>,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.update_customer(&id, request).await {
        Ok(customer) => {
            Json(json!({ "id": customer.id, "customer": customer })).into_response()
        }
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn delete_customer(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.delete_customer(&id).await {
        Ok(()) => Json(json!({ "deleted": id })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn create_team(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(request): Json<CreateTeamRequest>,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.create_team(request).await {
        Ok(team) => Json(json!({ "id": team.id, "team": team })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn update_team(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateTeamRequest>,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.update_team(&id, request).await {
        Ok(team) => Json(json!({ "id": team.id, "team": team })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn delete_team(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.delete_team(&id).await {
        Ok(()) => Json(json!({ "deleted": id })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn create_virtual_key(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(request): Json<CreateVirtualKeyRequest>,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.create_virtual_key(request).await {
        Ok(vk) => Json(json!({ "id": vk.id, "virtual_key": vk })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn update_virtual_key(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateVirtualKeyRequest>,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.update_virtual_key(&id, request).await {
        Ok(vk) => Json(json!({ "id": vk.id, "virtual_key": vk })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn delete_virtual_key(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.delete_virtual_key(&id).await {
        Ok(()) => Json(json!({ "deleted": id })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn update_budget(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<BudgetSpec>,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.update_budget(&id, request).await {
        Ok(budget) => Json(json!({ "id": budget.id, "budget": budget })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn update_rate_limit(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RateLimitSpec>,
) -> Response {
    if let Err(err) = state.authorize_admin(&headers).await {
        return error_response(&err);
    }
    match state.governance.update_rate_limit(&id, request).await {
        Ok(rate_limit) => {
            Json(json!({ "id": rate_limit.id, "rate_limit": rate_limit })).into_response()
        }
        Err(err) => error_response(&err),
    }
}
