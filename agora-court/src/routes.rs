//! HTTP surface of the Court.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use agora_core::clients::{
    CentralBankClient, IdentityClient, ReputationClient, TaskBoardClient, VerifiedToken,
};
use agora_core::db::blocking;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::http::{
    extract_token, method_not_allowed, not_found, parse_json_body, payload_str, require_action,
    require_platform_signer, validate_json_request, BodyLimit, StartClock,
};

use crate::config::DisputesSection;
use crate::judges::Judge;
use crate::orchestrator::RulingOrchestrator;
use crate::store::DisputeStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DisputeStore>,
    pub identity: Arc<dyn IdentityClient>,
    pub bank: Arc<dyn CentralBankClient>,
    pub board: Arc<dyn TaskBoardClient>,
    pub reputation: Arc<dyn ReputationClient>,
    pub judges: Arc<Vec<Arc<dyn Judge>>>,
    pub orchestrator: Arc<RulingOrchestrator>,
    pub platform_agent_id: String,
    pub disputes: DisputesSection,
    pub clock: StartClock,
}

pub fn router(state: AppState, limit: BodyLimit) -> Router {
    Router::new()
        .route(
            "/disputes/file",
            post(file_dispute).fallback(method_not_allowed),
        )
        .route(
            "/disputes",
            get(list_disputes).fallback(method_not_allowed),
        )
        .route(
            "/disputes/:dispute_id",
            get(get_dispute).fallback(method_not_allowed),
        )
        .route(
            "/disputes/:dispute_id/rebuttal",
            post(submit_rebuttal).fallback(method_not_allowed),
        )
        .route(
            "/disputes/:dispute_id/rule",
            post(trigger_ruling).fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(limit, validate_json_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Verify the body token and require a platform signature with the action
async fn verify_platform(
    state: &AppState,
    body: &[u8],
    expected_action: &str,
) -> ServiceResult<VerifiedToken> {
    let data = parse_json_body(body)?;
    let token = extract_token(&data, "token")?;
    let verified = state.identity.verify_jws(&token).await?;
    require_action(&verified.payload, expected_action)?;
    require_platform_signer(&verified.agent_id, &state.platform_agent_id)?;
    Ok(verified)
}

fn require_dispute_id_match(verified: &VerifiedToken, dispute_id: &str) -> ServiceResult<()> {
    if payload_str(&verified.payload, "dispute_id")? != dispute_id {
        return Err(ServiceError::invalid_payload(
            "Payload dispute_id does not match URL",
        ));
    }
    Ok(())
}

async fn file_dispute(
    State(state): State<AppState>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_platform(&state, &body, "file_dispute").await?;

    let task_id = payload_str(&verified.payload, "task_id")?;
    let claimant_id = payload_str(&verified.payload, "claimant_id")?;
    let respondent_id = payload_str(&verified.payload, "respondent_id")?;
    let claim = payload_str(&verified.payload, "claim")?;
    let escrow_id = payload_str(&verified.payload, "escrow_id")?;
    if claim.len() > state.disputes.max_claim_length {
        return Err(ServiceError::invalid_payload("Claim exceeds maximum length"));
    }

    // The task must exist before we open proceedings against it.
    state.board.get_task(&task_id).await?;

    let store = state.store.clone();
    let deadline_seconds = state.disputes.rebuttal_deadline_seconds;
    let dispute = blocking(move || {
        store.file(
            &task_id,
            &claimant_id,
            &respondent_id,
            &claim,
            &escrow_id,
            deadline_seconds,
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(dispute)))
}

async fn submit_rebuttal(
    State(state): State<AppState>,
    Path(dispute_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_platform(&state, &body, "submit_rebuttal").await?;
    require_dispute_id_match(&verified, &dispute_id)?;

    let rebuttal = payload_str(&verified.payload, "rebuttal")?;
    if rebuttal.len() > state.disputes.max_rebuttal_length {
        return Err(ServiceError::invalid_payload(
            "Rebuttal exceeds maximum length",
        ));
    }

    let store = state.store.clone();
    let dispute =
        blocking(move || store.submit_rebuttal(&dispute_id, &rebuttal)).await?;
    Ok(Json(dispute))
}

async fn trigger_ruling(
    State(state): State<AppState>,
    Path(dispute_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let verified = verify_platform(&state, &body, "trigger_ruling").await?;
    require_dispute_id_match(&verified, &dispute_id)?;

    let dispute = {
        let store = state.store.clone();
        let dispute_id = dispute_id.clone();
        blocking(move || store.get(&dispute_id)).await?
    }
    .ok_or_else(|| ServiceError::not_found("DISPUTE_NOT_FOUND", "Dispute not found"))?;

    let task = state.board.get_task(&dispute.task_id).await?;

    let ruled = state
        .orchestrator
        .execute_ruling(
            &dispute_id,
            &state.judges,
            &task,
            state.bank.as_ref(),
            state.reputation.as_ref(),
            state.board.as_ref(),
            &state.platform_agent_id,
        )
        .await?;
    Ok(Json(ruled))
}

async fn get_dispute(
    State(state): State<AppState>,
    Path(dispute_id): Path<String>,
) -> ServiceResult<impl IntoResponse> {
    let store = state.store.clone();
    let dispute = blocking(move || store.get(&dispute_id))
        .await?
        .ok_or_else(|| ServiceError::not_found("DISPUTE_NOT_FOUND", "Dispute not found"))?;
    Ok(Json(dispute))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    task_id: Option<String>,
    status: Option<String>,
}

async fn list_disputes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ServiceResult<impl IntoResponse> {
    let store = state.store.clone();
    let disputes = blocking(move || {
        store.list(query.task_id.as_deref(), query.status.as_deref())
    })
    .await?;
    Ok(Json(json!({ "disputes": disputes })))
}

async fn health(State(state): State<AppState>) -> ServiceResult<impl IntoResponse> {
    let store = state.store.clone();
    let (total_disputes, active_disputes) =
        blocking(move || Ok((store.count_total()?, store.count_active()?))).await?;
    Ok(Json(json!({
        "status": "ok",
        "uptime_seconds": state.clock.uptime_seconds(),
        "started_at": state.clock.started_at(),
        "total_disputes": total_disputes,
        "active_disputes": active_disputes,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judges::FixedJudge;
    use agora_core::clients::EscrowReceipt;
    use agora_core::jws;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header::CONTENT_TYPE, Request};
    use ed25519_dalek::SigningKey;
    use serde_json::{Map, Value};
    use tower::ServiceExt;

    const PLATFORM: &str = "a-platform";

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

    struct StubBank;

    #[async_trait]
    impl CentralBankClient for StubBank {
        async fn lock_escrow(&self, _t: &str) -> ServiceResult<EscrowReceipt> {
            unimplemented!()
        }
        async fn release_escrow(&self, _e: &str, _r: &str) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn split_escrow(&self, _e: &str, _w: &str, _p: &str, _pct: i64) -> ServiceResult<()> {
            Ok(())
        }
    }

    struct StubReputation;

    #[async_trait]
    impl ReputationClient for StubReputation {
        async fn record_feedback(&self, _f: &Value) -> ServiceResult<()> {
            Ok(())
        }
    }

    struct StubBoard {
        missing: bool,
    }

    #[async_trait]
    impl TaskBoardClient for StubBoard {
        async fn get_task(&self, _task_id: &str) -> ServiceResult<Map<String, Value>> {
            if self.missing {
                return Err(ServiceError::not_found("TASK_NOT_FOUND", "Task not found"));
            }
            Ok(json!({
                "title": "Sum a list",
                "spec": "Add the numbers",
                "reward": 500,
                "deliverables": ["result.txt sha256:abc"],
            })
            .as_object()
            .cloned()
            .unwrap())
        }
        async fn record_ruling(&self, _task_id: &str, _ruling: &Value) -> ServiceResult<()> {
            Ok(())
        }
    }

    fn app(board_missing: bool) -> Router {
        let store = Arc::new(DisputeStore::open_in_memory().unwrap());
        let judges: Vec<Arc<dyn Judge>> = vec![
            Arc::new(FixedJudge::new("j1", 60, "Partial delivery.")),
            Arc::new(FixedJudge::new("j2", 70, "Mostly fine.")),
            Arc::new(FixedJudge::new("j3", 80, "Acceptable.")),
        ];
        let state = AppState {
            store: store.clone(),
            identity: Arc::new(TrustingIdentity),
            bank: Arc::new(StubBank),
            board: Arc::new(StubBoard {
                missing: board_missing,
            }),
            reputation: Arc::new(StubReputation),
            judges: Arc::new(judges),
            orchestrator: Arc::new(RulingOrchestrator::new(store)),
            platform_agent_id: PLATFORM.to_string(),
            disputes: DisputesSection {
                rebuttal_deadline_seconds: 3600,
                max_claim_length: 2000,
                max_rebuttal_length: 2000,
            },
            clock: StartClock::now(),
        };
        router(state, BodyLimit(256 * 1024))
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

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn file_dispute(app: &Router) -> Value {
        let token = signed(
            PLATFORM,
            json!({"action": "file_dispute", "task_id": "t-5",
                   "claimant_id": "a-alice", "respondent_id": "a-bob",
                   "claim": "Output is wrong", "escrow_id": "esc-5"}),
        );
        let response = app
            .clone()
            .oneshot(post_token("/disputes/file", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await
    }

    #[tokio::test]
    async fn full_dispute_flow_files_rebuts_and_rules() {
        let app = app(false);
        let dispute = file_dispute(&app).await;
        let dispute_id = dispute["dispute_id"].as_str().unwrap().to_string();
        assert_eq!(dispute["status"], json!("rebuttal_pending"));

        let token = signed(
            PLATFORM,
            json!({"action": "submit_rebuttal", "dispute_id": dispute_id,
                   "rebuttal": "The sum is correct"}),
        );
        let response = app
            .clone()
            .oneshot(post_token(&format!("/disputes/{dispute_id}/rebuttal"), token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await["status"],
            json!("rebuttal_submitted")
        );

        let token = signed(
            PLATFORM,
            json!({"action": "trigger_ruling", "dispute_id": dispute_id}),
        );
        let response = app
            .clone()
            .oneshot(post_token(&format!("/disputes/{dispute_id}/rule"), token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ruled = body_json(response).await;
        assert_eq!(ruled["status"], json!("ruled"));
        assert_eq!(ruled["worker_pct"], json!(70));
        assert_eq!(ruled["votes"].as_array().unwrap().len(), 3);

        // Ruling a ruled dispute conflicts.
        let token = signed(
            PLATFORM,
            json!({"action": "trigger_ruling", "dispute_id": dispute_id}),
        );
        let response = app
            .clone()
            .oneshot(post_token(&format!("/disputes/{dispute_id}/rule"), token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            body_json(response).await["error"],
            json!("DISPUTE_ALREADY_RULED")
        );
    }

    #[tokio::test]
    async fn non_platform_signers_are_forbidden() {
        let app = app(false);
        let token = signed(
            "a-alice",
            json!({"action": "file_dispute", "task_id": "t-5",
                   "claimant_id": "a-alice", "respondent_id": "a-bob",
                   "claim": "Bad", "escrow_id": "esc-5"}),
        );
        let response = app
            .oneshot(post_token("/disputes/file", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn filing_against_missing_task_propagates_404() {
        let app = app(true);
        let token = signed(
            PLATFORM,
            json!({"action": "file_dispute", "task_id": "t-missing",
                   "claimant_id": "a-alice", "respondent_id": "a-bob",
                   "claim": "Bad", "escrow_id": "esc-5"}),
        );
        let response = app
            .oneshot(post_token("/disputes/file", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], json!("TASK_NOT_FOUND"));
    }

    #[tokio::test]
    async fn dispute_id_mismatch_is_invalid_payload() {
        let app = app(false);
        let dispute = file_dispute(&app).await;
        let dispute_id = dispute["dispute_id"].as_str().unwrap();

        let token = signed(
            PLATFORM,
            json!({"action": "submit_rebuttal", "dispute_id": "disp-other",
                   "rebuttal": "x"}),
        );
        let response = app
            .oneshot(post_token(&format!("/disputes/{dispute_id}/rebuttal"), token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"],
            json!("INVALID_PAYLOAD")
        );
    }

    #[tokio::test]
    async fn list_and_get_disputes() {
        let app = app(false);
        let dispute = file_dispute(&app).await;
        let dispute_id = dispute["dispute_id"].as_str().unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/disputes?status=rebuttal_pending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list = body_json(response).await;
        assert_eq!(list["disputes"].as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/disputes/{dispute_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/disputes/disp-missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
