//! # groop-store
//!
//! Device-local key storage for the Groop chat core, backed by SQLite
//! (SQLCipher when the `sqlcipher` feature is enabled).
//!
//! Holds the secrets that must never reach the shared backing store: each
//! local account's X25519 keypair and the per-group symmetric key ring. The
//! crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for both.

pub mod database;
pub mod group_keys;
pub mod keypairs;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
