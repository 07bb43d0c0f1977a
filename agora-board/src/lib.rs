//! Task Board service: the task state machine, sealed one-round bidding,
//! deliverable asset custody, and deadline-driven auto-transitions,
//! coordinating escrow through the Central Bank.

pub mod assets;
pub mod config;
pub mod deadline;
pub mod escrow;
pub mod routes;
pub mod store;
pub mod tasks;
pub mod tokens;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agora_core::clients::{http_client, HttpCentralBankClient, HttpIdentityClient};
use agora_core::http::{BodyLimit, StartClock};
use agora_core::jws::PlatformSigner;

use crate::assets::AssetManager;
use crate::config::Settings;
use crate::deadline::DeadlineEvaluator;
use crate::escrow::EscrowCoordinator;
use crate::routes::AppState;
use crate::store::TaskStore;
use crate::tasks::{Limits, TaskManager};
use crate::tokens::TokenValidator;

/// Run the Task Board service until shutdown
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let store = Arc::new(TaskStore::open(Path::new(&settings.database.path))?);

    let key_path = settings
        .platform
        .private_key_path
        .clone()
        .unwrap_or_else(|| "platform.pem".to_string());
    let signer = Arc::new(PlatformSigner::load_or_generate(
        &settings.platform.agent_id,
        Path::new(&key_path),
    )?);

    let identity_http = http_client(settings.identity.timeout_seconds)?;
    let identity = Arc::new(HttpIdentityClient::new(
        identity_http,
        settings.identity.base_url.clone(),
    ));
    let bank_http = http_client(settings.central_bank.timeout_seconds)?;
    let bank = Arc::new(HttpCentralBankClient::new(
        bank_http,
        settings.central_bank.base_url.clone(),
        signer,
    ));

    let tokens = Arc::new(TokenValidator::new(identity));
    let escrow = Arc::new(EscrowCoordinator::new(bank.clone(), store.clone()));
    let deadlines = Arc::new(DeadlineEvaluator::new(store.clone(), escrow.clone()));

    let manager = Arc::new(TaskManager::new(
        store.clone(),
        tokens.clone(),
        bank,
        escrow,
        deadlines.clone(),
        settings.platform.agent_id.clone(),
        Limits {
            max_title_length: settings.limits.max_title_length,
            max_spec_length: settings.limits.max_spec_length,
            max_reason_length: settings.limits.max_reason_length,
        },
    ));
    let assets = Arc::new(AssetManager::new(
        store.clone(),
        tokens,
        deadlines,
        PathBuf::from(&settings.assets.storage_path),
        settings.assets.max_file_size,
        settings.assets.max_files_per_task,
    )?);

    let state = AppState {
        manager,
        assets,
        store,
        clock: StartClock::now(),
    };
    let max_upload = settings.assets.max_file_size + 64 * 1024;
    let app = routes::router(
        state,
        BodyLimit(settings.request.max_body_size),
        max_upload,
    );

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(service = %settings.service.name, %addr, "task board listening");
    axum::serve(listener, app).await?;
    Ok(())
}
