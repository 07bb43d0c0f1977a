//! HTTP clients for the collaborator services.
//!
//! Each client is a trait so services can be tested against stubs; the
//! `Http*` implementations use a pooled reqwest client with a configured
//! timeout. Transport failures and unexpected responses map to the caller's
//! `*_UNAVAILABLE` 502 code; recognizable 4xx envelopes are propagated with
//! their original code and status.

mod bank;
mod board;
mod identity;
mod reputation;

pub use bank::{CentralBankClient, EscrowReceipt, HttpCentralBankClient};
pub use board::{HttpTaskBoardClient, TaskBoardClient};
pub use identity::{HttpIdentityClient, IdentityClient, VerifiedToken};
pub use reputation::{HttpReputationClient, ReputationClient};

use std::time::Duration;

use serde_json::Value;

use crate::error::ServiceError;

/// Build the pooled outbound HTTP client used by all service clients
pub fn http_client(timeout_seconds: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .map_err(|err| anyhow::anyhow!("building HTTP client: {err}"))
}

/// Rebuild a `ServiceError` from a collaborator's error envelope, falling
/// back to the given 502 code when the body is not a recognizable envelope.
fn propagate_envelope(
    status: u16,
    body: &Value,
    fallback_code: &str,
    fallback_message: &str,
) -> ServiceError {
    if let (Some(code), Some(message)) = (
        body.get("error").and_then(Value::as_str),
        body.get("message").and_then(Value::as_str),
    ) {
        let details = body.get("details").cloned().unwrap_or(Value::Null);
        let mut err = ServiceError::new(code, message, status);
        if details.is_object() {
            err = err.with_details(details);
        }
        return err;
    }
    ServiceError::unavailable(fallback_code, fallback_message)
}
