//! HTTP surface of the Task Board.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use agora_core::db::blocking;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::http::{
    bearer_token, extract_token, method_not_allowed, not_found, parse_json_body,
    validate_json_request, validate_multipart_request, BodyLimit, StartClock,
};

use crate::assets::AssetManager;
use crate::store::{TaskFilter, TaskStore};
use crate::tasks::TaskManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TaskManager>,
    pub assets: Arc<AssetManager>,
    pub store: Arc<TaskStore>,
    pub clock: StartClock,
}

pub fn router(state: AppState, limit: BodyLimit, max_upload_bytes: usize) -> Router {
    let json_routes = Router::new()
        .route(
            "/tasks",
            post(create_task).get(list_tasks).fallback(method_not_allowed),
        )
        .route("/tasks/:task_id", get(get_task).fallback(method_not_allowed))
        .route(
            "/tasks/:task_id/cancel",
            post(cancel_task).fallback(method_not_allowed),
        )
        .route(
            "/tasks/:task_id/submit",
            post(submit_deliverable).fallback(method_not_allowed),
        )
        .route(
            "/tasks/:task_id/approve",
            post(approve_task).fallback(method_not_allowed),
        )
        .route(
            "/tasks/:task_id/dispute",
            post(dispute_task).fallback(method_not_allowed),
        )
        .route(
            "/tasks/:task_id/ruling",
            post(record_ruling).fallback(method_not_allowed),
        )
        .route(
            "/tasks/:task_id/bids",
            post(submit_bid).get(list_bids).fallback(method_not_allowed),
        )
        .route(
            "/tasks/:task_id/bids/:bid_id/accept",
            post(accept_bid).fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(limit, validate_json_request));

    let asset_routes = Router::new()
        .route(
            "/tasks/:task_id/assets",
            post(upload_asset).get(list_assets).fallback(method_not_allowed),
        )
        .route(
            "/tasks/:task_id/assets/:asset_id",
            get(download_asset).fallback(method_not_allowed),
        )
        .layer(middleware::from_fn(validate_multipart_request))
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    Router::new()
        .merge(json_routes)
        .merge(asset_routes)
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn create_task(
    State(state): State<AppState>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let data = parse_json_body(&body)?;
    let task_token = extract_token(&data, "task_token")?;
    let escrow_token = extract_token(&data, "escrow_token")?;
    let view = state.manager.create_task(&task_token, &escrow_token).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ServiceResult<impl IntoResponse> {
    let parse_int = |name: &str, min: i64| -> ServiceResult<Option<i64>> {
        match params.get(name) {
            None => Ok(None),
            Some(raw) => {
                let value: i64 = raw.parse().map_err(|_| {
                    ServiceError::invalid_payload(format!("{name} must be an integer"))
                })?;
                if value < min {
                    return Err(ServiceError::invalid_payload(format!(
                        "{name} must be >= {min}"
                    )));
                }
                Ok(Some(value))
            }
        }
    };

    let filter = TaskFilter {
        status: params.get("status").cloned(),
        poster_id: params.get("poster_id").cloned(),
        worker_id: params.get("worker_id").cloned(),
        offset: parse_int("offset", 0)?,
        limit: parse_int("limit", 1)?,
    };
    let tasks = state.manager.list_tasks(filter).await?;
    Ok(Json(json!({ "tasks": tasks })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ServiceResult<impl IntoResponse> {
    Ok(Json(state.manager.get_task(&task_id).await?))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let token = extract_token(&parse_json_body(&body)?, "token")?;
    Ok(Json(state.manager.cancel_task(&task_id, &token).await?))
}

async fn submit_deliverable(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let token = extract_token(&parse_json_body(&body)?, "token")?;
    Ok(Json(
        state.manager.submit_deliverable(&task_id, &token).await?,
    ))
}

async fn approve_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let token = extract_token(&parse_json_body(&body)?, "token")?;
    Ok(Json(state.manager.approve_task(&task_id, &token).await?))
}

async fn dispute_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let token = extract_token(&parse_json_body(&body)?, "token")?;
    Ok(Json(state.manager.dispute_task(&task_id, &token).await?))
}

async fn record_ruling(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let token = extract_token(&parse_json_body(&body)?, "token")?;
    Ok(Json(state.manager.record_ruling(&task_id, &token).await?))
}

async fn submit_bid(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let token = extract_token(&parse_json_body(&body)?, "token")?;
    let bid = state.manager.submit_bid(&task_id, &token).await?;
    Ok((StatusCode::CREATED, Json(bid)))
}

async fn list_bids(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> ServiceResult<impl IntoResponse> {
    let bearer = bearer_token(&headers)?;
    let bids = state.manager.list_bids(&task_id, bearer).await?;
    Ok(Json(json!({ "task_id": task_id, "bids": bids })))
}

async fn accept_bid(
    State(state): State<AppState>,
    Path((task_id, bid_id)): Path<(String, String)>,
    body: Bytes,
) -> ServiceResult<impl IntoResponse> {
    let token = extract_token(&parse_json_body(&body)?, "token")?;
    Ok(Json(
        state.manager.accept_bid(&task_id, &bid_id, &token).await?,
    ))
}

async fn upload_asset(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ServiceResult<impl IntoResponse> {
    let token = bearer_token(&headers)?
        .ok_or_else(|| ServiceError::invalid_jws("Missing Authorization header"))?;

    let mut file: Option<(String, String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ServiceError::invalid_payload("Malformed multipart body"))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .unwrap_or("deliverable.bin")
            .to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(|_| {
            ServiceError::new("FILE_TOO_LARGE", "Uploaded file is too large", 413)
        })?;
        file = Some((filename, content_type, bytes.to_vec()));
        break;
    }
    let (filename, content_type, content) =
        file.ok_or_else(|| ServiceError::invalid_payload("Missing file field"))?;

    let asset = state
        .assets
        .upload(&task_id, &token, &filename, &content_type, content)
        .await?;
    Ok((StatusCode::CREATED, Json(asset)))
}

async fn list_assets(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ServiceResult<impl IntoResponse> {
    let assets = state.assets.list(&task_id).await?;
    Ok(Json(json!({ "task_id": task_id, "assets": assets })))
}

async fn download_asset(
    State(state): State<AppState>,
    Path((task_id, asset_id)): Path<(String, String)>,
) -> ServiceResult<impl IntoResponse> {
    let (bytes, content_type, filename) = state.assets.download(&task_id, &asset_id).await?;
    Ok((
        [
            (CONTENT_TYPE, content_type),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}

async fn health(State(state): State<AppState>) -> ServiceResult<impl IntoResponse> {
    let store = state.store.clone();
    let (total_tasks, open_tasks) =
        blocking(move || Ok((store.count_tasks()?, store.count_open_tasks()?))).await?;
    Ok(Json(json!({
        "status": "ok",
        "uptime_seconds": state.clock.uptime_seconds(),
        "started_at": state.clock.started_at(),
        "total_tasks": total_tasks,
        "open_tasks": open_tasks,
    })))
}
