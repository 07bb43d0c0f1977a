//! Court service: multi-judge dispute resolution. Files disputes, collects
//! rebuttals, evaluates an odd-sized judge panel, and applies the median
//! ruling — escrow split, reputation feedback, and the Task Board record —
//! before persisting the outcome.

pub mod config;
pub mod judges;
pub mod orchestrator;
pub mod routes;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use agora_core::clients::{
    http_client, HttpCentralBankClient, HttpIdentityClient, HttpReputationClient,
    HttpTaskBoardClient,
};
use agora_core::http::{BodyLimit, StartClock};
use agora_core::jws::PlatformSigner;

use crate::config::Settings;
use crate::orchestrator::RulingOrchestrator;
use crate::routes::AppState;
use crate::store::DisputeStore;

/// Run the Court service until shutdown
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    settings.judges.validate()?;

    let store = Arc::new(DisputeStore::open(Path::new(&settings.database.path))?);

    let key_path = settings
        .platform
        .private_key_path
        .clone()
        .unwrap_or_else(|| "platform.pem".to_string());
    let signer = Arc::new(PlatformSigner::load_or_generate(
        &settings.platform.agent_id,
        Path::new(&key_path),
    )?);

    let identity = Arc::new(HttpIdentityClient::new(
        http_client(settings.identity.timeout_seconds)?,
        settings.identity.base_url.clone(),
    ));
    let bank = Arc::new(HttpCentralBankClient::new(
        http_client(settings.central_bank.timeout_seconds)?,
        settings.central_bank.base_url.clone(),
        signer.clone(),
    ));
    let board = Arc::new(HttpTaskBoardClient::new(
        http_client(settings.task_board.timeout_seconds)?,
        settings.task_board.base_url.clone(),
        signer.clone(),
    ));
    let reputation = Arc::new(HttpReputationClient::new(
        http_client(settings.reputation.timeout_seconds)?,
        settings.reputation.base_url.clone(),
        signer,
    ));

    let judge_http = http_client(settings.identity.timeout_seconds)?;
    let judges = Arc::new(judges::build_panel(&settings.judges, judge_http)?);
    if judges.is_empty() {
        tracing::warn!("no judge API configured; rulings will be unavailable");
    }

    let state = AppState {
        store: store.clone(),
        identity,
        bank,
        board,
        reputation,
        judges,
        orchestrator: Arc::new(RulingOrchestrator::new(store)),
        platform_agent_id: settings.platform.agent_id.clone(),
        disputes: settings.disputes.clone(),
        clock: StartClock::now(),
    };
    let app = routes::router(state, BodyLimit(settings.request.max_body_size));

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(service = %settings.service.name, %addr, "court listening");
    axum::serve(listener, app).await?;
    Ok(())
}
