//! Central Bank service: authoritative accounting. An append-only ledger
//! with escrow lock/release/split, atomic under `BEGIN IMMEDIATE`, with
//! exactly-once credits keyed by `(account, reference)`.

pub mod config;
pub mod ledger;
pub mod routes;

use std::path::Path;
use std::sync::Arc;

use agora_core::clients::{http_client, HttpIdentityClient};
use agora_core::http::{BodyLimit, StartClock};
use agora_core::jws::PlatformSigner;

use crate::config::Settings;
use crate::ledger::Ledger;
use crate::routes::AppState;

/// Run the Central Bank service until shutdown
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let ledger = Arc::new(Ledger::open(Path::new(&settings.database.path))?);

    // The bank never signs outbound requests, but generating the platform
    // key here keeps first-boot ordering flexible across services.
    if let Some(key_path) = &settings.platform.private_key_path {
        PlatformSigner::load_or_generate(&settings.platform.agent_id, Path::new(key_path))?;
    }

    let http = http_client(settings.identity.timeout_seconds)?;
    let identity = Arc::new(HttpIdentityClient::new(http, settings.identity.base_url.clone()));

    let state = AppState {
        ledger,
        identity,
        platform_agent_id: settings.platform.agent_id.clone(),
        clock: StartClock::now(),
    };
    let app = routes::router(state, BodyLimit(settings.request.max_body_size));

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(service = %settings.service.name, %addr, "central bank listening");
    axum::serve(listener, app).await?;
    Ok(())
}
