//! Agent registry: registration, lookup, and JWS verification.
//!
//! The registry is the platform's only holder of public keys. Agents are
//! immutable once registered and never deleted; the `public_key` column
//! carries a UNIQUE constraint so one key maps to at most one agent.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};

use agora_core::db;
use agora_core::error::{ServiceError, ServiceResult};
use agora_core::ids::new_id;
use agora_core::jws;
use agora_core::time::now_iso;

/// Full agent record
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    pub public_key: String,
    pub registered_at: String,
}

/// List-view record; the public key is omitted for brevity
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub name: String,
    pub registered_at: String,
}

/// Outcome of a JWS verification request.
///
/// A signature mismatch is an observable result, not an error.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    Valid {
        agent_id: String,
        payload: Map<String, Value>,
    },
    Invalid {
        reason: String,
    },
}

pub struct AgentRegistry {
    conn: Mutex<Connection>,
}

impl AgentRegistry {
    pub fn open(path: &Path) -> ServiceResult<Self> {
        Self::with_connection(db::open(path)?)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        Self::with_connection(db::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                public_key TEXT NOT NULL UNIQUE,
                registered_at TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::internal("Registry lock poisoned"))
    }

    /// Register a new agent after validating its name and public key
    pub fn register(&self, name: &str, public_key: &str) -> ServiceResult<Agent> {
        if name.trim().is_empty() {
            return Err(ServiceError::new(
                "INVALID_NAME",
                "Name cannot be empty or whitespace-only",
                400,
            ));
        }
        jws::decode_public_key(public_key)?;

        let agent = Agent {
            agent_id: new_id("a"),
            name: name.to_string(),
            public_key: public_key.to_string(),
            registered_at: now_iso(),
        };

        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO agents (agent_id, name, public_key, registered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                agent.agent_id,
                agent.name,
                agent.public_key,
                agent.registered_at
            ],
        );
        match inserted {
            Ok(_) => Ok(agent),
            Err(err) if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) => {
                Err(ServiceError::conflict(
                    "PUBLIC_KEY_EXISTS",
                    "This public key is already registered",
                ))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, agent_id: &str) -> ServiceResult<Option<Agent>> {
        let conn = self.lock()?;
        let agent = conn
            .query_row(
                "SELECT agent_id, name, public_key, registered_at
                 FROM agents WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok(Agent {
                        agent_id: row.get(0)?,
                        name: row.get(1)?,
                        public_key: row.get(2)?,
                        registered_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(agent)
    }

    /// All agents ordered by registration time
    pub fn list(&self) -> ServiceResult<Vec<AgentSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT agent_id, name, registered_at FROM agents ORDER BY registered_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AgentSummary {
                agent_id: row.get(0)?,
                name: row.get(1)?,
                registered_at: row.get(2)?,
            })
        })?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    pub fn count(&self) -> ServiceResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?)
    }

    /// Verify a compact JWS token against the key of the agent named in its
    /// `kid` header.
    pub fn verify_jws(&self, token: &str) -> ServiceResult<VerifyOutcome> {
        let (header_b64, payload_b64, _) = jws::split_compact(token)?;
        let header = jws::decode_json_object(header_b64, "header")?;

        if header.get("alg").and_then(Value::as_str) != Some("EdDSA") {
            return Err(ServiceError::invalid_jws(
                "Only EdDSA algorithm is supported",
            ));
        }
        let kid = match header.get("kid").and_then(Value::as_str) {
            Some(kid) if !kid.is_empty() => kid.to_string(),
            _ => {
                return Err(ServiceError::invalid_jws(
                    "JWS header must contain a 'kid' field with the agent_id",
                ))
            }
        };

        let agent = self
            .get(&kid)?
            .ok_or_else(|| ServiceError::not_found("AGENT_NOT_FOUND", "Agent not found"))?;

        let key = jws::decode_public_key(&agent.public_key).map_err(|_| {
            ServiceError::internal("Registered public key is no longer parseable")
        })?;

        if !jws::verify_signature(token, &key)? {
            return Ok(VerifyOutcome::Invalid {
                reason: "signature mismatch".to_string(),
            });
        }

        let payload_bytes = jws::b64url_decode(payload_b64)
            .map_err(|_| ServiceError::invalid_jws("JWS payload is not valid base64url"))?;
        let payload: Value = serde_json::from_slice(&payload_bytes)
            .map_err(|_| ServiceError::invalid_jws("JWS payload is not valid JSON"))?;
        let payload = match payload {
            Value::Object(map) => map,
            _ => {
                return Err(ServiceError::invalid_jws(
                    "JWS payload must be a JSON object",
                ))
            }
        };

        Ok(VerifyOutcome::Valid {
            agent_id: kid,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    fn registry() -> AgentRegistry {
        AgentRegistry::open_in_memory().unwrap()
    }

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut rand::rngs::OsRng)
    }

    fn register(registry: &AgentRegistry, name: &str, key: &SigningKey) -> Agent {
        registry
            .register(name, &jws::encode_public_key(&key.verifying_key()))
            .unwrap()
    }

    #[test]
    fn register_assigns_prefixed_id() {
        let reg = registry();
        let agent = register(&reg, "Alice", &keypair());
        assert!(agent.agent_id.starts_with("a-"));
        assert!(agent.registered_at.ends_with('Z'));
    }

    #[test]
    fn duplicate_public_key_conflicts() {
        let reg = registry();
        let key = keypair();
        register(&reg, "Alice", &key);

        let err = reg
            .register("Bob", &jws::encode_public_key(&key.verifying_key()))
            .unwrap_err();
        assert_eq!(err.code, "PUBLIC_KEY_EXISTS");
        assert_eq!(err.status, 409);
    }

    #[test]
    fn empty_name_rejected() {
        let reg = registry();
        let key = keypair();
        let err = reg
            .register("   ", &jws::encode_public_key(&key.verifying_key()))
            .unwrap_err();
        assert_eq!(err.code, "INVALID_NAME");
    }

    #[test]
    fn list_omits_public_keys_and_orders_by_registration() {
        let reg = registry();
        register(&reg, "Alice", &keypair());
        register(&reg, "Bob", &keypair());

        let agents = reg.list().unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(reg.count().unwrap(), 2);
    }

    #[test]
    fn verify_jws_happy_path() {
        let reg = registry();
        let key = keypair();
        let agent = register(&reg, "Alice", &key);

        let token = jws::sign_compact(&json!({"action": "create_task"}), &key, &agent.agent_id);
        match reg.verify_jws(&token).unwrap() {
            VerifyOutcome::Valid { agent_id, payload } => {
                assert_eq!(agent_id, agent.agent_id);
                assert_eq!(payload.get("action"), Some(&json!("create_task")));
            }
            VerifyOutcome::Invalid { reason } => panic!("unexpected invalid: {reason}"),
        }
    }

    #[test]
    fn verify_jws_wrong_key_is_observable_not_error() {
        let reg = registry();
        let key = keypair();
        let other = keypair();
        let agent = register(&reg, "Alice", &key);

        let token = jws::sign_compact(&json!({"n": 1}), &other, &agent.agent_id);
        match reg.verify_jws(&token).unwrap() {
            VerifyOutcome::Invalid { reason } => assert_eq!(reason, "signature mismatch"),
            VerifyOutcome::Valid { .. } => panic!("forged token verified"),
        }
    }

    #[test]
    fn verify_jws_unknown_agent_404() {
        let reg = registry();
        let key = keypair();
        let token = jws::sign_compact(&json!({"n": 1}), &key, "a-missing");
        let err = reg.verify_jws(&token).unwrap_err();
        assert_eq!(err.code, "AGENT_NOT_FOUND");
        assert_eq!(err.status, 404);
    }

    #[test]
    fn verify_jws_rejects_malformed_tokens() {
        let reg = registry();
        let key = keypair();
        let agent = register(&reg, "Alice", &key);

        // Two parts
        assert_eq!(reg.verify_jws("a.b").unwrap_err().code, "INVALID_JWS");

        // Wrong algorithm in header
        let header = jws::b64url_encode(br#"{"alg":"RS256","kid":"a-x"}"#);
        let bad = format!("{header}.e30.c2ln");
        assert_eq!(reg.verify_jws(&bad).unwrap_err().code, "INVALID_JWS");

        // Missing kid
        let header = jws::b64url_encode(br#"{"alg":"EdDSA"}"#);
        let bad = format!("{header}.e30.c2ln");
        assert_eq!(reg.verify_jws(&bad).unwrap_err().code, "INVALID_JWS");

        // Non-object payload, correctly signed
        let token = jws::sign_compact(&json!({"n": 1}), &key, &agent.agent_id);
        let (header, _, _) = jws::split_compact(&token).unwrap();
        let scalar_payload = jws::b64url_encode(b"42");
        let forged = format!("{header}.{scalar_payload}.AAAA");
        assert_eq!(reg.verify_jws(&forged).unwrap_err().code, "INVALID_JWS");
    }

    #[test]
    fn one_bit_flip_breaks_verification() {
        let reg = registry();
        let key = keypair();
        let agent = register(&reg, "Alice", &key);
        let token = jws::sign_compact(&json!({"amount": 500}), &key, &agent.agent_id);

        let (header, payload, signature) = jws::split_compact(&token).unwrap();
        let mut sig_bytes = jws::b64url_decode(signature).unwrap();
        sig_bytes[10] ^= 0x01;
        let flipped = format!("{header}.{payload}.{}", jws::b64url_encode(&sig_bytes));

        match reg.verify_jws(&flipped).unwrap() {
            VerifyOutcome::Invalid { .. } => {}
            VerifyOutcome::Valid { .. } => panic!("tampered signature verified"),
        }
    }
}
