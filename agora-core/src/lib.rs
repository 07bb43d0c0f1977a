//! Shared substrate for the Agora services.
//!
//! This crate carries everything the four services have in common:
//! - the `ServiceError` type and HTTP error envelope
//! - compact JWS (EdDSA/Ed25519) signing and verification
//! - platform key management
//! - YAML configuration loading with unknown-key rejection
//! - SQLite helpers (WAL, busy timeout, `BEGIN IMMEDIATE`)
//! - the HTTP clients for Identity, Central Bank, Task Board, Reputation

pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod ids;
pub mod jws;
pub mod time;

pub use error::{ServiceError, ServiceResult};
