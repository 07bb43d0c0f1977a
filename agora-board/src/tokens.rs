//! Token validation for task lifecycle operations.
//!
//! Signature verification is delegated to the Identity service; this module
//! layers the board's error precedence on top: structural `INVALID_JWS`
//! first, then `IDENTITY_SERVICE_UNAVAILABLE` / `FORBIDDEN` from the
//! verification round-trip, then `INVALID_PAYLOAD` for a wrong action.

use std::sync::Arc;

use serde_json::{Map, Value};

use agora_core::clients::{IdentityClient, VerifiedToken};
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::http::require_action;
use agora_core::jws;

pub struct TokenValidator {
    identity: Arc<dyn IdentityClient>,
}

impl TokenValidator {
    pub fn new(identity: Arc<dyn IdentityClient>) -> Self {
        Self { identity }
    }

    /// Verify a token via Identity and check its `action` field
    pub async fn validate(
        &self,
        token: &str,
        expected_action: &str,
    ) -> ServiceResult<VerifiedToken> {
        jws::split_compact(token)?;
        let verified = self.identity.verify_jws(token).await?;
        require_action(&verified.payload, expected_action)?;
        Ok(verified)
    }

    /// Decode the payload section of the escrow token WITHOUT verifying its
    /// signature. The Task Board only cross-validates `task_id` and `amount`
    /// here; the Central Bank verifies the token independently, so the board
    /// never needs (or gets) proof it could forge.
    pub fn decode_escrow_payload(escrow_token: &str) -> ServiceResult<Map<String, Value>> {
        let (_, payload_b64, _) = jws::split_compact(escrow_token)?;
        jws::decode_json_object(payload_b64, "payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use serde_json::json;

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

    struct RejectingIdentity;

    #[async_trait]
    impl IdentityClient for RejectingIdentity {
        async fn verify_jws(&self, _token: &str) -> ServiceResult<VerifiedToken> {
            Err(ServiceError::forbidden("JWS signature verification failed"))
        }
    }

    fn token(payload: Value) -> String {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        jws::sign_compact(&payload, &key, "a-signer")
    }

    #[tokio::test]
    async fn validates_action_after_verification() {
        let validator = TokenValidator::new(Arc::new(TrustingIdentity));

        let verified = validator
            .validate(&token(json!({"action": "submit_bid"})), "submit_bid")
            .await
            .unwrap();
        assert_eq!(verified.agent_id, "a-signer");

        let err = validator
            .validate(&token(json!({"action": "submit_bid"})), "accept_bid")
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_PAYLOAD");

        let err = validator
            .validate(&token(json!({"title": "no action"})), "accept_bid")
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn structural_check_precedes_identity_roundtrip() {
        // The rejecting stub would return FORBIDDEN, but a malformed token
        // never reaches it.
        let validator = TokenValidator::new(Arc::new(RejectingIdentity));
        let err = validator.validate("not-a-jws", "submit_bid").await.unwrap_err();
        assert_eq!(err.code, "INVALID_JWS");

        let err = validator
            .validate("aaa.bbb.ccc", "submit_bid")
            .await
            .unwrap_err();
        assert_eq!(err.code, "FORBIDDEN");
    }

    #[test]
    fn escrow_payload_decodes_without_verification() {
        let escrow_token = token(json!({"action": "escrow_lock", "task_id": "t-1", "amount": 500}));
        let payload = TokenValidator::decode_escrow_payload(&escrow_token).unwrap();
        assert_eq!(payload.get("amount"), Some(&json!(500)));

        let err = TokenValidator::decode_escrow_payload("x.y").unwrap_err();
        assert_eq!(err.code, "INVALID_JWS");
    }
}
