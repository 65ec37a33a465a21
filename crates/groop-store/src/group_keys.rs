//! Per-group key ring.
//!
//! Every key version a device has ever held is kept in `group_keys`, and
//! `active_group_keys` points at the version used for new messages. Writers
//! never move the active pointer backwards: a stale key that arrives after a
//! rotation joins the ring without displacing the newer key. Versions are
//! write-once.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use groop_shared::GroopId;

use crate::database::Database;
use crate::error::Result;
use crate::keypairs::decode_key;
use crate::models::{GroupKey, KeyStoreOutcome};

impl Database {
    /// Version number a freshly generated key for `groop_id` should take.
    pub fn next_group_key_version(&self, groop_id: &GroopId) -> Result<u32> {
        let max: Option<u32> = self.conn().query_row(
            "SELECT MAX(version) FROM group_keys WHERE groop_id = ?1",
            params![groop_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(max.map_or(1, |v| v + 1))
    }

    /// Store a key version and advance the active pointer if it is at least
    /// as new as the current one.
    ///
    /// A version is written once. Re-storing the same key is a no-op; a
    /// different key under an existing version is refused with
    /// [`KeyStoreOutcome::Conflict`] and leaves the ring untouched.
    pub fn store_group_key(&mut self, key: &GroupKey) -> Result<KeyStoreOutcome> {
        let tx = self.conn_mut().transaction()?;
        let key_hex = hex::encode(key.symmetric_key);

        let existing: Option<String> = tx
            .query_row(
                "SELECT key_hex FROM group_keys WHERE groop_id = ?1 AND version = ?2",
                params![key.groop_id.as_str(), key.version],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(stored) if stored != key_hex => {
                tracing::warn!(
                    groop = %key.groop_id,
                    version = key.version,
                    "refusing to replace existing group key version"
                );
                return Ok(KeyStoreOutcome::Conflict);
            }
            Some(_) => {}
            None => {
                tx.execute(
                    "INSERT INTO group_keys (groop_id, version, key_hex, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        key.groop_id.as_str(),
                        key.version,
                        key_hex,
                        key.created_at.to_rfc3339(),
                    ],
                )?;
            }
        }

        let active: Option<u32> = tx
            .query_row(
                "SELECT version FROM active_group_keys WHERE groop_id = ?1",
                params![key.groop_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = if active.map_or(true, |current| key.version >= current) {
            tx.execute(
                "INSERT OR REPLACE INTO active_group_keys (groop_id, version) VALUES (?1, ?2)",
                params![key.groop_id.as_str(), key.version],
            )?;
            KeyStoreOutcome::Activated
        } else {
            KeyStoreOutcome::Retained
        };

        tx.commit()?;
        Ok(outcome)
    }

    pub fn get_active_group_key(&self, groop_id: &GroopId) -> Result<Option<GroupKey>> {
        self.conn()
            .query_row(
                "SELECT k.groop_id, k.version, k.key_hex, k.created_at
                 FROM active_group_keys a
                 JOIN group_keys k ON k.groop_id = a.groop_id AND k.version = a.version
                 WHERE a.groop_id = ?1",
                params![groop_id.as_str()],
                row_to_raw,
            )
            .optional()?
            .map(RawGroupKey::into_key)
            .transpose()
    }

    pub fn get_group_key(&self, groop_id: &GroopId, version: u32) -> Result<Option<GroupKey>> {
        self.conn()
            .query_row(
                "SELECT groop_id, version, key_hex, created_at
                 FROM group_keys WHERE groop_id = ?1 AND version = ?2",
                params![groop_id.as_str(), version],
                row_to_raw,
            )
            .optional()?
            .map(RawGroupKey::into_key)
            .transpose()
    }

    /// All retained versions for a group, newest first.
    pub fn list_group_keys(&self, groop_id: &GroopId) -> Result<Vec<GroupKey>> {
        let mut stmt = self.conn().prepare(
            "SELECT groop_id, version, key_hex, created_at
             FROM group_keys WHERE groop_id = ?1
             ORDER BY version DESC",
        )?;

        let rows = stmt.query_map(params![groop_id.as_str()], row_to_raw)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?.into_key()?);
        }
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct RawGroupKey {
    groop_id: String,
    version: u32,
    key_hex: String,
    created_at: String,
}

impl RawGroupKey {
    fn into_key(self) -> Result<GroupKey> {
        let symmetric_key = decode_key(&self.key_hex, &self.groop_id)?;
        let created_at: DateTime<Utc> =
            DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc);
        Ok(GroupKey {
            groop_id: GroopId(self.groop_id),
            symmetric_key,
            version: self.version,
            created_at,
        })
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawGroupKey> {
    Ok(RawGroupKey {
        groop_id: row.get(0)?,
        version: row.get(1)?,
        key_hex: row.get(2)?,
        created_at: row.get(3)?,
    })
}
