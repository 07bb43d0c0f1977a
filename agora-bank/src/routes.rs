//! HTTP surface of the Central Bank.
//!
//! Three privilege tiers, checked after Identity verifies the signature:
//! self-service (own account creation and reads), agent-signed (escrow lock
//! by the payer), and platform-signed (credits, release, split).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use agora_core::clients::{IdentityClient, VerifiedToken};
use agora_core::db::blocking;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::http::{
    bearer_token, extract_token, method_not_allowed, not_found, parse_json_body, payload_i64,
    payload_str, require_action, require_platform_signer, validate_json_request, BodyLimit,
    StartClock,
};

use crate::ledger::Ledger;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub identity: Arc<dyn IdentityClient>,
    pub platform_agent_id: String,
    pub clock: StartClock,
}

pub fn router(state: AppState, limit: BodyLimit) -> Router {
    Router::new()
        .route(
            "/accounts",
            post(create_account).fallback(method_not_allowed),
        )
        .route(
            "/accounts/:account_id",
            get(get_account).fallback(method_not_allowed),
        )
        .route(
            "/accounts/:account_id/credit",
            post(credit_account).fallback(method_not_allowed),
        )
        .route(
            "/accounts/:account_id/transactions",
            get(list_transactions).fallback(method_not_allowed),
        )
        .route("/escrow/lock", post(lock_escrow).fallback(method_not_allowed))
        .route(
            "/escrow/:escrow_id/release",
            post(release_escrow).fallback(method_not_allowed),
        )
        .route(
            "/escrow/:escrow_id/split",
            post(split_escrow).fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(limit, validate_json_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn verify_body_token(state: &AppState, body: &[u8]) -> ServiceResult<VerifiedToken> {
    let data = parse_json_body(body)?;
    let token = extract_token(&data, "token")?;
    state.identity.verify_jws(&token).await
}

async fn verify_bearer(state: &AppState, headers: &HeaderMap) -> ServiceResult<VerifiedToken> {
    let token = bearer_token(headers)?
        .ok_or_else(|| ServiceError::forbidden("Authentication required"))?;
    state.identity.verify_jws(&token).await
}

fn require_account_owner(verified_agent_id: &str, account_id: &str) -> ServiceResult<()> {
    if verified_agent_id != account_id {
        return Err(ServiceError::forbidden(
            "You can only access your own account",
        ));
    }
    Ok(())
}

async fn create_account(
    State(state): State<AppState>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_body_token(&state, &body).await?;
    require_action(&verified.payload, "create_account")?;
    let account_id = payload_str(&verified.payload, "account_id")?;

    // Platform-authorized creation may seed a balance; self-service may
    // only create its own account and always starts from zero.
    let initial_balance = if verified.agent_id == state.platform_agent_id {
        match verified.payload.get("initial_balance") {
            None => 0,
            Some(value) => value.as_i64().ok_or_else(|| {
                ServiceError::invalid_payload("initial_balance must be an integer")
            })?,
        }
    } else {
        if verified.agent_id != account_id {
            return Err(ServiceError::forbidden(
                "You can only create your own account",
            ));
        }
        0
    };

    let ledger = state.ledger.clone();
    let account = blocking(move || ledger.create_account(&account_id, initial_balance)).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_bearer(&state, &headers).await?;
    require_account_owner(&verified.agent_id, &account_id)?;

    let ledger = state.ledger.clone();
    let account = blocking(move || ledger.get_account(&account_id))
        .await?
        .ok_or_else(|| ServiceError::not_found("ACCOUNT_NOT_FOUND", "Account not found"))?;
    Ok(Json(account))
}

async fn credit_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_body_token(&state, &body).await?;
    require_action(&verified.payload, "credit")?;
    require_platform_signer(&verified.agent_id, &state.platform_agent_id)?;

    if payload_str(&verified.payload, "account_id")? != account_id {
        return Err(ServiceError::invalid_payload(
            "account_id in payload does not match URL path",
        ));
    }
    let amount = payload_i64(&verified.payload, "amount")?;
    let reference = payload_str(&verified.payload, "reference")?;

    let ledger = state.ledger.clone();
    let applied = blocking(move || ledger.credit(&account_id, amount, &reference)).await?;
    let status = if applied.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(applied.record)))
}

async fn list_transactions(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_bearer(&state, &headers).await?;
    require_account_owner(&verified.agent_id, &account_id)?;

    let ledger = state.ledger.clone();
    let account = account_id.clone();
    let transactions = blocking(move || ledger.transactions(&account)).await?;
    Ok(Json(json!({
        "account_id": account_id,
        "transactions": transactions,
    })))
}

async fn lock_escrow(
    State(state): State<AppState>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_body_token(&state, &body).await?;
    require_action(&verified.payload, "escrow_lock")?;

    let payer_id = payload_str(&verified.payload, "agent_id")?;
    let task_id = payload_str(&verified.payload, "task_id")?;
    let amount = payload_i64(&verified.payload, "amount")?;
    if verified.agent_id != payer_id {
        return Err(ServiceError::forbidden(
            "Escrow lock must be signed by the payer",
        ));
    }

    let ledger = state.ledger.clone();
    let applied = blocking(move || ledger.escrow_lock(&payer_id, amount, &task_id)).await?;
    let status = if applied.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(applied.record)))
}

async fn release_escrow(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_body_token(&state, &body).await?;
    require_action(&verified.payload, "escrow_release")?;
    require_platform_signer(&verified.agent_id, &state.platform_agent_id)?;

    if payload_str(&verified.payload, "escrow_id")? != escrow_id {
        return Err(ServiceError::invalid_payload(
            "escrow_id in payload does not match URL path",
        ));
    }
    let recipient_id = payload_str(&verified.payload, "recipient_account_id")?;

    let ledger = state.ledger.clone();
    let escrow = blocking(move || ledger.escrow_release(&escrow_id, &recipient_id)).await?;
    Ok(Json(escrow))
}

async fn split_escrow(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_body_token(&state, &body).await?;
    require_action(&verified.payload, "escrow_split")?;
    require_platform_signer(&verified.agent_id, &state.platform_agent_id)?;

    if payload_str(&verified.payload, "escrow_id")? != escrow_id {
        return Err(ServiceError::invalid_payload(
            "escrow_id in payload does not match URL path",
        ));
    }
    let worker_id = payload_str(&verified.payload, "worker_account_id")?;
    let poster_id = payload_str(&verified.payload, "poster_account_id")?;
    let worker_pct = payload_i64(&verified.payload, "worker_pct")?;
    if !(0..=100).contains(&worker_pct) {
        return Err(ServiceError::invalid_payload(
            "worker_pct must be between 0 and 100",
        ));
    }

    let ledger = state.ledger.clone();
    let escrow =
        blocking(move || ledger.escrow_split(&escrow_id, &worker_id, &poster_id, worker_pct))
            .await?;
    Ok(Json(escrow))
}

async fn health(State(state): State<AppState>) -> ServiceResult<impl IntoResponse> {
    let ledger = state.ledger.clone();
    let (total_accounts, total_escrows) =
        blocking(move || Ok((ledger.count_accounts()?, ledger.count_escrows()?))).await?;
    Ok(Json(json!({
        "status": "ok",
        "uptime_seconds": state.clock.uptime_seconds(),
        "started_at": state.clock.started_at(),
        "total_accounts": total_accounts,
        "total_escrows": total_escrows,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::jws;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header::AUTHORIZATION, header::CONTENT_TYPE, Request};
    use ed25519_dalek::SigningKey;
    use tower::ServiceExt;

    const PLATFORM: &str = "a-platform";

    /// Test double that trusts the token's own header/payload, standing in
    /// for a live Identity service.
    struct TrustingIdentity;

    #[async_trait]
    impl IdentityClient for TrustingIdentity {
        async fn verify_jws(&self, token: &str) -> ServiceResult<VerifiedToken> {
            let (header_b64, payload_b64, _) = jws::split_compact(token)?;
            let header = jws::decode_json_object(header_b64, "header")?;
            let payload = jws::decode_json_object(payload_b64, "payload")?;
            let agent_id = header
                .get("kid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(VerifiedToken { agent_id, payload })
        }
    }

    fn app() -> Router {
        let state = AppState {
            ledger: Arc::new(Ledger::open_in_memory().unwrap()),
            identity: Arc::new(TrustingIdentity),
            platform_agent_id: PLATFORM.to_string(),
            clock: StartClock::now(),
        };
        router(state, BodyLimit(64 * 1024))
    }

    fn signed(kid: &str, payload: Value) -> String {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        jws::sign_compact(&payload, &key, kid)
    }

    fn post_token(path: &str, token: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "token": token }).to_string()))
            .unwrap()
    }

    fn get_bearer(path: &str, token: String) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_funded(app: &Router, account_id: &str, balance: i64) {
        let token = signed(
            PLATFORM,
            json!({"action": "create_account", "account_id": account_id,
                   "initial_balance": balance}),
        );
        let response = app
            .clone()
            .oneshot(post_token("/accounts", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn platform_seeds_balance_self_service_does_not() {
        let app = app();
        create_funded(&app, "a-alice", 5000).await;

        // Self-service creation forces a zero balance even if one is asked for.
        let token = signed(
            "a-bob",
            json!({"action": "create_account", "account_id": "a-bob",
                   "initial_balance": 900}),
        );
        let response = app
            .clone()
            .oneshot(post_token("/accounts", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let account = response_json(response).await;
        assert_eq!(account["balance"], json!(0));

        // Creating someone else's account is forbidden.
        let token = signed(
            "a-bob",
            json!({"action": "create_account", "account_id": "a-carol"}),
        );
        let response = app
            .clone()
            .oneshot(post_token("/accounts", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn duplicate_account_is_409() {
        let app = app();
        create_funded(&app, "a-alice", 0).await;
        let token = signed(
            PLATFORM,
            json!({"action": "create_account", "account_id": "a-alice"}),
        );
        let response = app.oneshot(post_token("/accounts", token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response_json(response).await["error"], json!("ACCOUNT_EXISTS"));
    }

    #[tokio::test]
    async fn credit_requires_platform_signer() {
        let app = app();
        create_funded(&app, "a-alice", 0).await;

        let token = signed(
            "a-alice",
            json!({"action": "credit", "account_id": "a-alice",
                   "amount": 100, "reference": "grant-1"}),
        );
        let response = app
            .oneshot(post_token("/accounts/a-alice/credit", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn credit_replay_returns_original_transaction() {
        let app = app();
        create_funded(&app, "a-alice", 0).await;
        let payload = json!({"action": "credit", "account_id": "a-alice",
                             "amount": 100, "reference": "grant-1"});

        let response = app
            .clone()
            .oneshot(post_token(
                "/accounts/a-alice/credit",
                signed(PLATFORM, payload.clone()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let first = response_json(response).await;

        let response = app
            .clone()
            .oneshot(post_token(
                "/accounts/a-alice/credit",
                signed(PLATFORM, payload),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let replay = response_json(response).await;
        assert_eq!(replay["tx_id"], first["tx_id"]);

        // Different amount under the same reference is a conflict, not a credit.
        let response = app
            .oneshot(post_token(
                "/accounts/a-alice/credit",
                signed(
                    PLATFORM,
                    json!({"action": "credit", "account_id": "a-alice",
                           "amount": 101, "reference": "grant-1"}),
                ),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response_json(response).await["error"],
            json!("PAYLOAD_MISMATCH")
        );
    }

    #[tokio::test]
    async fn balance_reads_are_owner_only() {
        let app = app();
        create_funded(&app, "a-alice", 5000).await;

        let response = app
            .clone()
            .oneshot(get_bearer(
                "/accounts/a-alice",
                signed("a-alice", json!({"action": "get_balance"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["balance"], json!(5000));

        let response = app
            .clone()
            .oneshot(get_bearer(
                "/accounts/a-alice",
                signed("a-bob", json!({"action": "get_balance"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // No Authorization header at all.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/accounts/a-alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn escrow_lock_must_be_signed_by_payer() {
        let app = app();
        create_funded(&app, "a-alice", 5000).await;

        let token = signed(
            "a-bob",
            json!({"action": "escrow_lock", "agent_id": "a-alice",
                   "amount": 500, "task_id": "t-1"}),
        );
        let response = app.oneshot(post_token("/escrow/lock", token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn lock_release_flow_over_http() {
        let app = app();
        create_funded(&app, "a-alice", 5000).await;
        create_funded(&app, "a-bob", 0).await;

        let token = signed(
            "a-alice",
            json!({"action": "escrow_lock", "agent_id": "a-alice",
                   "amount": 500, "task_id": "t-1"}),
        );
        let response = app
            .clone()
            .oneshot(post_token("/escrow/lock", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let escrow = response_json(response).await;
        let escrow_id = escrow["escrow_id"].as_str().unwrap().to_string();
        assert_eq!(escrow["status"], json!("locked"));

        let token = signed(
            PLATFORM,
            json!({"action": "escrow_release", "escrow_id": escrow_id,
                   "recipient_account_id": "a-bob"}),
        );
        let response = app
            .clone()
            .oneshot(post_token(&format!("/escrow/{escrow_id}/release"), token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["status"], json!("released"));

        let response = app
            .oneshot(get_bearer(
                "/accounts/a-bob",
                signed("a-bob", json!({"action": "get_balance"})),
            ))
            .await
            .unwrap();
        assert_eq!(response_json(response).await["balance"], json!(500));
    }

    #[tokio::test]
    async fn split_pct_out_of_range_is_rejected() {
        let app = app();
        create_funded(&app, "a-alice", 5000).await;

        let token = signed(
            PLATFORM,
            json!({"action": "escrow_split", "escrow_id": "esc-x",
                   "worker_account_id": "a-bob", "poster_account_id": "a-alice",
                   "worker_pct": 101}),
        );
        let response = app
            .oneshot(post_token("/escrow/esc-x/split", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response_json(response).await["error"],
            json!("INVALID_PAYLOAD")
        );
    }
}
