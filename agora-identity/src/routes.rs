//! HTTP surface of the Identity service.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use agora_core::db::blocking;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::http::{
    extract_token, method_not_allowed, not_found, parse_json_body, validate_json_request,
    BodyLimit, StartClock,
};

use crate::registry::{AgentRegistry, VerifyOutcome};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub clock: StartClock,
}

pub fn router(state: AppState, limit: BodyLimit) -> Router {
    Router::new()
        .route(
            "/agents/register",
            post(register_agent).fallback(method_not_allowed),
        )
        .route("/agents", get(list_agents).fallback(method_not_allowed))
        .route(
            "/agents/verify-jws",
            post(verify_jws).fallback(method_not_allowed),
        )
        .route(
            "/agents/:agent_id",
            get(get_agent).fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(limit, validate_json_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn register_agent(
    State(state): State<AppState>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let data = parse_json_body(&body)?;
    let name = data
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::invalid_payload("Missing required field: name"))?
        .to_string();
    let public_key = data
        .get("public_key")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::invalid_payload("Missing required field: public_key"))?
        .to_string();

    let registry = state.registry.clone();
    let agent = blocking(move || registry.register(&name, &public_key)).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents(State(state): State<AppState>) -> ServiceResult<impl IntoResponse> {
    let registry = state.registry.clone();
    let agents = blocking(move || registry.list()).await?;
    Ok(Json(json!({ "agents": agents })))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ServiceResult<impl IntoResponse> {
    let registry = state.registry.clone();
    let agent = blocking(move || registry.get(&agent_id))
        .await?
        .ok_or_else(|| ServiceError::not_found("AGENT_NOT_FOUND", "Agent not found"))?;
    Ok(Json(agent))
}

async fn verify_jws(
    State(state): State<AppState>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let data = parse_json_body(&body)?;
    let token = extract_token(&data, "token")?;

    let registry = state.registry.clone();
    let outcome = blocking(move || registry.verify_jws(&token)).await?;
    let body = match outcome {
        VerifyOutcome::Valid { agent_id, payload } => {
            json!({"valid": true, "agent_id": agent_id, "payload": payload})
        }
        VerifyOutcome::Invalid { reason } => json!({"valid": false, "reason": reason}),
    };
    Ok(Json(body))
}

async fn health(State(state): State<AppState>) -> ServiceResult<impl IntoResponse> {
    let registry = state.registry.clone();
    let total_agents = blocking(move || registry.count()).await?;
    Ok(Json(json!({
        "status": "ok",
        "uptime_seconds": state.clock.uptime_seconds(),
        "started_at": state.clock.started_at(),
        "total_agents": total_agents,
    })))
}
