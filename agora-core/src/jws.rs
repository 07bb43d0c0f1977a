//! Compact JWS (EdDSA/Ed25519) signing and verification.
//!
//! Every signed request in the platform is a three-part compact token
//! `base64url(header).base64url(payload).base64url(signature)` where the
//! header is `{"alg":"EdDSA","typ":"JWT","kid":"<agent_id>"}` and the
//! Ed25519 signature covers the ASCII string `header.payload`.
//!
//! Public keys travel as `ed25519:<base64-raw-32>` strings; the platform
//! private key is a PKCS#8 PEM file generated on first startup.

use std::fs;
use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::{json, Map, Value};

use crate::error::{ServiceError, ServiceResult};

/// Prefix carried by every registered public key
pub const PUBLIC_KEY_PREFIX: &str = "ed25519:";

const PUBLIC_KEY_BYTES: usize = 32;
const SIGNATURE_BYTES: usize = 64;

/// Base64url-encode without padding
pub fn b64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Base64url-decode, tolerating absent padding
pub fn b64url_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(data.trim_end_matches('='))
}

/// Export a verifying key in the registry wire format
pub fn encode_public_key(key: &VerifyingKey) -> String {
    format!("{PUBLIC_KEY_PREFIX}{}", STANDARD.encode(key.as_bytes()))
}

/// Parse and validate an `ed25519:<base64>` public key string.
///
/// Rejects a missing prefix, invalid base64, wrong length, the all-zero
/// key, and byte strings that are not a valid Ed25519 point.
pub fn decode_public_key(public_key: &str) -> ServiceResult<VerifyingKey> {
    let invalid = |message: &str| ServiceError::new("INVALID_PUBLIC_KEY", message, 400);

    let encoded = public_key
        .strip_prefix(PUBLIC_KEY_PREFIX)
        .ok_or_else(|| invalid(&format!("Public key must start with '{PUBLIC_KEY_PREFIX}'")))?;

    let key_bytes = STANDARD
        .decode(encoded)
        .map_err(|_| invalid("Public key contains invalid base64"))?;

    if key_bytes.len() != PUBLIC_KEY_BYTES {
        return Err(invalid(&format!(
            "Public key must be exactly {PUBLIC_KEY_BYTES} bytes"
        )));
    }
    if key_bytes.iter().all(|b| *b == 0) {
        return Err(invalid("All-zero public key is not allowed"));
    }

    let mut raw = [0u8; PUBLIC_KEY_BYTES];
    raw.copy_from_slice(&key_bytes);
    VerifyingKey::from_bytes(&raw).map_err(|_| invalid("Not a valid Ed25519 public key"))
}

/// Split a compact token into its three dot-separated parts
pub fn split_compact(token: &str) -> ServiceResult<(&str, &str, &str)> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(ServiceError::invalid_jws(
            "Token is not a valid JWS compact serialization",
        ));
    }
    Ok((parts[0], parts[1], parts[2]))
}

/// Decode a base64url JSON object from a JWS part
pub fn decode_json_object(part: &str, section: &str) -> ServiceResult<Map<String, Value>> {
    let bytes = b64url_decode(part)
        .map_err(|_| ServiceError::invalid_jws(format!("Token {section} is not valid base64url")))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|_| ServiceError::invalid_jws(format!("Token {section} is not valid JSON")))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ServiceError::invalid_jws(format!(
            "Token {section} must be a JSON object"
        ))),
    }
}

/// Create a compact JWS token over a JSON payload
pub fn sign_compact(payload: &Value, key: &SigningKey, kid: &str) -> String {
    let header = json!({"alg": "EdDSA", "typ": "JWT", "kid": kid});
    let header_b64 = b64url_encode(header.to_string().as_bytes());
    let payload_b64 = b64url_encode(payload.to_string().as_bytes());

    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature = key.sign(signing_input.as_bytes());
    let signature_b64 = b64url_encode(&signature.to_bytes());

    format!("{header_b64}.{payload_b64}.{signature_b64}")
}

/// Verify the signature of a compact token against a verifying key.
///
/// Returns `Ok(false)` on a signature mismatch; structural problems
/// (wrong part count, undecodable signature) are `INVALID_JWS` errors.
pub fn verify_signature(token: &str, key: &VerifyingKey) -> ServiceResult<bool> {
    let (header_b64, payload_b64, signature_b64) = split_compact(token)?;

    let signature_bytes = b64url_decode(signature_b64)
        .map_err(|_| ServiceError::invalid_jws("Token signature is not valid base64url"))?;
    if signature_bytes.len() != SIGNATURE_BYTES {
        return Err(ServiceError::invalid_jws(format!(
            "Signature must be exactly {SIGNATURE_BYTES} bytes"
        )));
    }
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|_| ServiceError::invalid_jws("Malformed Ed25519 signature"))?;

    let signing_input = format!("{header_b64}.{payload_b64}");
    Ok(key.verify(signing_input.as_bytes(), &signature).is_ok())
}

/// Signer for platform-authorized operations (escrow release/split,
/// ruling records, feedback). Holds the platform agent's Ed25519 key.
#[derive(Clone)]
pub struct PlatformSigner {
    agent_id: String,
    key: SigningKey,
}

impl PlatformSigner {
    pub fn new(agent_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            agent_id: agent_id.into(),
            key,
        }
    }

    /// Load the platform key from a PKCS#8 PEM file, generating a fresh
    /// keypair at that path on first startup.
    pub fn load_or_generate(agent_id: &str, path: &Path) -> anyhow::Result<Self> {
        let key = if path.exists() {
            let pem = fs::read_to_string(path)
                .with_context(|| format!("reading platform key {}", path.display()))?;
            SigningKey::from_pkcs8_pem(&pem)
                .map_err(|err| anyhow::anyhow!("invalid platform key {}: {err}", path.display()))?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating key directory {}", parent.display()))?;
            }
            let key = SigningKey::generate(&mut rand::rngs::OsRng);
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|err| anyhow::anyhow!("encoding platform key: {err}"))?;
            fs::write(path, pem.as_bytes())
                .with_context(|| format!("writing platform key {}", path.display()))?;
            key
        };
        Ok(Self::new(agent_id, key))
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Sign a payload into a compact token with `kid` = platform agent id
    pub fn sign(&self, payload: &Value) -> String {
        sign_compact(payload, &self.key, &self.agent_id)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// The platform public key in registry wire format
    pub fn public_key_string(&self) -> String {
        encode_public_key(&self.verifying_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::generate(&mut rand::rngs::OsRng)
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let key = test_key();
        let payload = json!({"action": "escrow_lock", "amount": 500});
        let token = sign_compact(&payload, &key, "a-test");

        assert!(verify_signature(&token, &key.verifying_key()).unwrap());

        let (_, payload_b64, _) = split_compact(&token).unwrap();
        let decoded = decode_json_object(payload_b64, "payload").unwrap();
        assert_eq!(decoded.get("amount"), Some(&json!(500)));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = test_key();
        let token = sign_compact(&json!({"n": 1}), &key, "a-test");
        let (header, _, signature) = split_compact(&token).unwrap();
        let forged_payload = b64url_encode(json!({"n": 2}).to_string().as_bytes());
        let forged = format!("{header}.{forged_payload}.{signature}");

        assert!(!verify_signature(&forged, &key.verifying_key()).unwrap());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let token = sign_compact(&json!({"n": 1}), &test_key(), "a-test");
        assert!(!verify_signature(&token, &test_key().verifying_key()).unwrap());
    }

    #[test]
    fn two_part_token_is_structural_error() {
        let err = split_compact("a.b").unwrap_err();
        assert_eq!(err.code, "INVALID_JWS");
    }

    #[test]
    fn public_key_roundtrip() {
        let key = test_key().verifying_key();
        let encoded = encode_public_key(&key);
        assert!(encoded.starts_with(PUBLIC_KEY_PREFIX));
        assert_eq!(decode_public_key(&encoded).unwrap(), key);
    }

    #[test]
    fn public_key_validation_rejects_bad_inputs() {
        for bad in [
            "nacl:AAAA",
            "ed25519:!!!not-base64!!!",
            "ed25519:AAAA",
            &format!("ed25519:{}", STANDARD.encode([0u8; 32])),
        ] {
            let err = decode_public_key(bad).unwrap_err();
            assert_eq!(err.code, "INVALID_PUBLIC_KEY", "input: {bad}");
        }
    }

    #[test]
    fn platform_key_generated_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/platform.pem");

        let first = PlatformSigner::load_or_generate("a-platform", &path).unwrap();
        assert!(path.exists());
        let second = PlatformSigner::load_or_generate("a-platform", &path).unwrap();
        assert_eq!(first.public_key_string(), second.public_key_string());

        let token = second.sign(&json!({"action": "escrow_release"}));
        assert!(verify_signature(&token, &first.verifying_key()).unwrap());
    }
}
