//! Identity service: agent registry and authenticator of Ed25519-signed
//! requests. Every other service delegates JWS verification here.

pub mod config;
pub mod registry;
pub mod routes;

use std::path::Path;
use std::sync::Arc;

use agora_core::http::{BodyLimit, StartClock};

use crate::config::Settings;
use crate::registry::AgentRegistry;
use crate::routes::AppState;

/// Run the Identity service until shutdown
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let registry = Arc::new(AgentRegistry::open(Path::new(&settings.database.path))?);
    let state = AppState {
        registry,
        clock: StartClock::now(),
    };
    let app = routes::router(state, BodyLimit(settings.request.max_body_size));

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(service = %settings.service.name, %addr, "identity service listening");
    axum::serve(listener, app).await?;
    Ok(())
}
