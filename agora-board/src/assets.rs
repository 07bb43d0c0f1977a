//! Deliverable asset custody: upload, listing, download.
//!
//! File bytes live on disk under `<storage>/<task_id>/<asset_id>/<filename>`;
//! the database row is the authoritative index. Writes are atomic (temp file
//! then rename) and both upload and download refuse any path that resolves
//! outside the storage root.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use agora_core::db::blocking;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::http::payload_str;
use agora_core::ids::new_id;
use agora_core::time::now_iso;

use crate::deadline::DeadlineEvaluator;
use crate::store::{Asset, TaskStatus, TaskStore};
use crate::tokens::TokenValidator;

pub struct AssetManager {
    store: Arc<TaskStore>,
    tokens: Arc<TokenValidator>,
    deadlines: Arc<DeadlineEvaluator>,
    storage_path: PathBuf,
    max_file_size: usize,
    max_files_per_task: usize,
}

impl AssetManager {
    pub fn new(
        store: Arc<TaskStore>,
        tokens: Arc<TokenValidator>,
        deadlines: Arc<DeadlineEvaluator>,
        storage_path: PathBuf,
        max_file_size: usize,
        max_files_per_task: usize,
    ) -> ServiceResult<Self> {
        fs::create_dir_all(&storage_path).map_err(|err| {
            ServiceError::internal(format!(
                "Cannot create asset storage {}: {err}",
                storage_path.display()
            ))
        })?;
        Ok(Self {
            store,
            tokens,
            deadlines,
            storage_path,
            max_file_size,
            max_files_per_task,
        })
    }

    /// Upload a deliverable. Worker-only, `accepted` status only, capped by
    /// size and per-task count.
    pub async fn upload(
        &self,
        task_id: &str,
        token: &str,
        filename: &str,
        content_type: &str,
        content: Vec<u8>,
    ) -> ServiceResult<Asset> {
        let verified = self.tokens.validate(token, "upload_asset").await?;
        let signer_id = verified.agent_id.clone();

        let payload_task_id = payload_str(&verified.payload, "task_id")?;
        if payload_task_id != task_id {
            return Err(ServiceError::invalid_payload(
                "task_id in payload does not match URL path",
            ));
        }
        if let Some(worker_id) = verified.payload.get("worker_id").and_then(Value::as_str) {
            if signer_id != worker_id {
                return Err(ServiceError::forbidden("Signer does not match worker_id"));
            }
        }

        let task = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || store.get_task(&task_id)).await?
        }
        .ok_or_else(|| ServiceError::not_found("TASK_NOT_FOUND", "Task not found"))?;
        let task = self.deadlines.evaluate(task).await?;

        // Status before role, so a stale worker sees the real state.
        if task.status != TaskStatus::Accepted {
            return Err(ServiceError::conflict(
                "INVALID_STATUS",
                format!(
                    "Cannot upload assets to task in '{}' status, must be 'accepted'",
                    task.status
                ),
            ));
        }
        if Some(signer_id.as_str()) != task.worker_id.as_deref() {
            return Err(ServiceError::forbidden(
                "Only the assigned worker can upload assets",
            ));
        }

        if content.len() > self.max_file_size {
            return Err(ServiceError::new(
                "FILE_TOO_LARGE",
                format!("File exceeds maximum size of {} bytes", self.max_file_size),
                413,
            ));
        }
        let existing = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || store.count_assets(&task_id)).await?
        };
        if existing as usize >= self.max_files_per_task {
            return Err(ServiceError::conflict(
                "TOO_MANY_ASSETS",
                format!(
                    "Maximum of {} assets per task reached",
                    self.max_files_per_task
                ),
            ));
        }

        let asset_id = new_id("asset");
        let asset_dir = self.storage_path.join(task_id).join(&asset_id);
        let file_path = confined_path(&asset_dir, filename)?;

        let content_hash = {
            let mut hasher = Sha256::new();
            hasher.update(&content);
            format!("{:x}", hasher.finalize())
        };

        let asset = Asset {
            asset_id,
            task_id: task_id.to_string(),
            uploader_id: signer_id,
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            size_bytes: content.len() as i64,
            content_hash,
            uploaded_at: now_iso(),
        };

        {
            let dir = asset_dir.clone();
            let path = file_path.clone();
            blocking(move || write_atomic(&dir, &path, &content)).await?;
        }
        {
            let store = self.store.clone();
            let row = asset.clone();
            blocking(move || store.insert_asset(&row)).await?;
        }
        Ok(asset)
    }

    /// List a task's assets. Public.
    pub async fn list(&self, task_id: &str) -> ServiceResult<Vec<Asset>> {
        let store = self.store.clone();
        let owner = task_id.to_string();
        let task = blocking({
            let store = store.clone();
            let task_id = owner.clone();
            move || store.get_task(&task_id)
        })
        .await?;
        if task.is_none() {
            return Err(ServiceError::not_found("TASK_NOT_FOUND", "Task not found"));
        }
        blocking(move || store.list_assets(&owner)).await
    }

    /// Download one asset's bytes with its stored content type and filename
    pub async fn download(
        &self,
        task_id: &str,
        asset_id: &str,
    ) -> ServiceResult<(Vec<u8>, String, String)> {
        let task = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            blocking(move || store.get_task(&task_id)).await?
        };
        if task.is_none() {
            return Err(ServiceError::not_found("TASK_NOT_FOUND", "Task not found"));
        }
        let asset = {
            let store = self.store.clone();
            let task_id = task_id.to_string();
            let asset_id = asset_id.to_string();
            blocking(move || store.get_asset(&task_id, &asset_id)).await?
        }
        .ok_or_else(|| ServiceError::not_found("ASSET_NOT_FOUND", "Asset not found"))?;

        let asset_dir = self.storage_path.join(task_id).join(asset_id);
        let file_path = confined_path(&asset_dir, &asset.filename)?;
        let storage_root = self
            .storage_path
            .canonicalize()
            .map_err(|_| ServiceError::not_found("ASSET_NOT_FOUND", "Asset not found"))?;
        let resolved = file_path
            .canonicalize()
            .map_err(|_| {
                ServiceError::not_found("ASSET_NOT_FOUND", "Asset file not found on disk")
            })?;
        if !resolved.starts_with(&storage_root) {
            return Err(ServiceError::not_found("ASSET_NOT_FOUND", "Asset not found"));
        }

        let bytes = blocking(move || {
            fs::read(&resolved).map_err(|_| {
                ServiceError::not_found("ASSET_NOT_FOUND", "Asset file not found on disk")
            })
        })
        .await?;
        Ok((bytes, asset.content_type, asset.filename))
    }
}

/// Join a client-supplied filename onto an asset directory, rejecting
/// anything that could resolve outside it.
fn confined_path(asset_dir: &Path, filename: &str) -> ServiceResult<PathBuf> {
    let name = Path::new(filename);
    let mut components = name.components();
    let valid = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if !valid || filename.contains("..") {
        return Err(ServiceError::not_found("ASSET_NOT_FOUND", "Asset not found"));
    }
    Ok(asset_dir.join(name))
}

/// Write a file atomically: temp file in the target directory, then rename
fn write_atomic(dir: &Path, path: &Path, content: &[u8]) -> ServiceResult<()> {
    fs::create_dir_all(dir)
        .map_err(|err| ServiceError::internal(format!("Cannot create asset dir: {err}")))?;
    let tmp = dir.join(".upload.tmp");
    fs::write(&tmp, content)
        .map_err(|err| ServiceError::internal(format!("Cannot write asset: {err}")))?;
    fs::rename(&tmp, path)
        .map_err(|err| ServiceError::internal(format!("Cannot finalize asset: {err}")))?;
    Ok(())
}
