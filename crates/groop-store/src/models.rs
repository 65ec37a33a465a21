//! Domain model structs persisted in the local key database.

use chrono::{DateTime, Utc};
use groop_shared::crypto::SymmetricKey;
use groop_shared::GroopId;

pub use groop_shared::UserKeyPair;

// ---------------------------------------------------------------------------
// GroupKey
// ---------------------------------------------------------------------------

/// One version of a group's symmetric message key.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupKey {
    /// The group this key encrypts messages for.
    pub groop_id: GroopId,
    /// XChaCha20-Poly1305 key (32 bytes), stored as hex in SQLite.
    pub symmetric_key: SymmetricKey,
    /// Monotonic per group; rotation creates `version + 1`.
    pub version: u32,
    /// When this device first stored the key.
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey")
            .field("groop_id", &self.groop_id)
            .field("version", &self.version)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// KeyStoreOutcome
// ---------------------------------------------------------------------------

/// Result of writing one key version to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStoreOutcome {
    /// Stored and now the active version.
    Activated,
    /// Stored; a newer version stays active.
    Retained,
    /// A different key already holds this version. Nothing was written.
    Conflict,
}

impl KeyStoreOutcome {
    pub fn is_stored(self) -> bool {
        !matches!(self, KeyStoreOutcome::Conflict)
    }
}
