//! v001 -- Initial schema creation.
//!
//! Creates the device-local key tables: `user_keypairs`, `group_keys` (the
//! per-group key ring) and `active_group_keys`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- User keypairs (one per local account, never rotated)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_keypairs (
    user_id        TEXT PRIMARY KEY NOT NULL,
    public_key_hex TEXT NOT NULL,             -- hex-encoded 32-byte X25519 pubkey
    secret_key_hex TEXT NOT NULL,             -- hex-encoded 32-byte X25519 secret
    created_at     TEXT NOT NULL              -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Group key ring (every version ever held, so history stays readable)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_keys (
    groop_id   TEXT NOT NULL,
    version    INTEGER NOT NULL,
    key_hex    TEXT NOT NULL,                 -- hex-encoded 32-byte symmetric key
    created_at TEXT NOT NULL,

    PRIMARY KEY (groop_id, version)
);

-- ----------------------------------------------------------------
-- Active key pointer, one row per group
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS active_group_keys (
    groop_id TEXT PRIMARY KEY NOT NULL,
    version  INTEGER NOT NULL,

    FOREIGN KEY (groop_id, version) REFERENCES group_keys(groop_id, version)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
