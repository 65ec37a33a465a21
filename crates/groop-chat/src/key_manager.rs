//! Device-local key management.
//!
//! [`KeyManager`] is the leaf of the chat core: it owns the user keypairs and
//! group key ring held in the local key database, and performs every
//! cryptographic operation the upper layers need. Nothing in here touches the
//! shared backing store.
//!
//! Apart from keypair and group key generation, which report
//! [`KeyError::CryptoUnavailable`], methods never fail across this boundary:
//! problems are logged and surface as `None` / `false`, leaving retry policy
//! to callers.

use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use groop_shared::constants::CIPHERTEXT_VERSION_SEPARATOR;
use groop_shared::crypto::{self, SymmetricKey};
use groop_shared::{GroopId, UserId, UserKeyPair};
use groop_store::{Database, GroupKey, KeyStoreOutcome};

use crate::config::ChatConfig;
use crate::error::KeyError;

/// Source of the "is a secure RNG available" answer.
pub trait EntropySource: Send + Sync {
    fn is_available(&self) -> bool;
}

/// The operating system RNG.
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn is_available(&self) -> bool {
        crypto::secure_random_available()
    }
}

/// Plaintext of a wrapped group key.
#[derive(Serialize, Deserialize)]
struct WrappedGroupKey {
    version: u32,
    key: SymmetricKey,
}

pub struct KeyManager {
    db: Mutex<Database>,
    entropy: Box<dyn EntropySource>,
}

impl KeyManager {
    pub fn new(db: Database) -> Self {
        Self::with_entropy(db, OsEntropy)
    }

    pub fn with_entropy(db: Database, entropy: impl EntropySource + 'static) -> Self {
        Self {
            db: Mutex::new(db),
            entropy: Box::new(entropy),
        }
    }

    /// Open the key database named by the configuration.
    pub fn open(config: &ChatConfig) -> Result<Self, KeyError> {
        let db = match &config.key_db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        Ok(Self::new(db))
    }

    /// Key manager over a throwaway in-memory database.
    pub fn in_memory() -> Result<Self, KeyError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check_secure_random_available(&self) -> bool {
        self.entropy.is_available()
    }

    // ------------------------------------------------------------------
    // User keypairs
    // ------------------------------------------------------------------

    /// Return the user's keypair, generating and persisting one on first use.
    pub fn get_or_create_user_keypair(&self, user_id: &UserId) -> Result<UserKeyPair, KeyError> {
        if let Some(existing) = self.db().get_keypair(user_id)? {
            return Ok(existing);
        }

        if !self.check_secure_random_available() {
            return Err(KeyError::CryptoUnavailable);
        }

        let keypair = UserKeyPair::generate(user_id.clone())?;
        let stored = self.db().insert_keypair_if_absent(&keypair)?;
        info!(user = %user_id, "generated device keypair");
        Ok(stored)
    }

    /// The user's keypair if this device holds one.
    pub fn user_keypair(&self, user_id: &UserId) -> Option<UserKeyPair> {
        self.db().get_keypair(user_id).unwrap_or_else(|e| {
            warn!(user = %user_id, error = %e, "failed to read keypair");
            None
        })
    }

    // ------------------------------------------------------------------
    // Group keys
    // ------------------------------------------------------------------

    /// Create a fresh key for the group and make it the active one.
    pub fn generate_group_key(&self, groop_id: &GroopId) -> Result<GroupKey, KeyError> {
        self.generate_group_key_after(groop_id, None)
    }

    /// Like [`generate_group_key`](Self::generate_group_key), but the new
    /// version is also above `known_version`, the newest version the group
    /// record says exists. A device that missed a rotation must not reuse
    /// that version number for a different key.
    pub fn generate_group_key_after(
        &self,
        groop_id: &GroopId,
        known_version: Option<u32>,
    ) -> Result<GroupKey, KeyError> {
        if !self.check_secure_random_available() {
            return Err(KeyError::CryptoUnavailable);
        }

        let symmetric_key = crypto::generate_symmetric_key()?;
        let mut db = self.db();
        let local_next = db.next_group_key_version(groop_id)?;
        let key = GroupKey {
            groop_id: groop_id.clone(),
            symmetric_key,
            version: known_version.map_or(local_next, |v| local_next.max(v + 1)),
            created_at: Utc::now(),
        };
        db.store_group_key(&key)?;

        info!(groop = %groop_id, version = key.version, "generated group key");
        Ok(key)
    }

    pub fn has_group_key(&self, groop_id: &GroopId) -> bool {
        self.active_group_key(groop_id).is_some()
    }

    pub fn active_group_key(&self, groop_id: &GroopId) -> Option<GroupKey> {
        self.db().get_active_group_key(groop_id).unwrap_or_else(|e| {
            warn!(groop = %groop_id, error = %e, "failed to read group key");
            None
        })
    }

    /// Versions retained for the group, newest first.
    pub fn key_versions(&self, groop_id: &GroopId) -> Vec<u32> {
        match self.db().list_group_keys(groop_id) {
            Ok(keys) => keys.iter().map(|k| k.version).collect(),
            Err(e) => {
                warn!(groop = %groop_id, error = %e, "failed to list group keys");
                Vec::new()
            }
        }
    }

    fn group_key_version(&self, groop_id: &GroopId, version: u32) -> Option<GroupKey> {
        self.db()
            .get_group_key(groop_id, version)
            .unwrap_or_else(|e| {
                warn!(groop = %groop_id, version, error = %e, "failed to read group key");
                None
            })
    }

    // ------------------------------------------------------------------
    // Message bodies
    // ------------------------------------------------------------------

    /// Encrypt with the active group key. `None` means "cannot encrypt now".
    ///
    /// Output is `<version>.<base64(nonce || ciphertext)>`.
    pub fn encrypt_message(&self, plaintext: &str, groop_id: &GroopId) -> Option<String> {
        let key = self.active_group_key(groop_id)?;
        match crypto::encrypt_text(&key.symmetric_key, plaintext) {
            Ok(body) => Some(format!(
                "{}{}{}",
                key.version, CIPHERTEXT_VERSION_SEPARATOR, body
            )),
            Err(e) => {
                warn!(groop = %groop_id, error = %e, "message encryption failed");
                None
            }
        }
    }

    /// Decrypt a message body. `None` on missing key or corrupt input.
    pub fn decrypt_message(&self, ciphertext: &str, groop_id: &GroopId) -> Option<String> {
        let (key, body) = match split_versioned(ciphertext) {
            Some((version, body)) => match self.group_key_version(groop_id, version) {
                Some(key) => (key, body),
                None => {
                    debug!(groop = %groop_id, version, "no local key for ciphertext version");
                    return None;
                }
            },
            None => (self.active_group_key(groop_id)?, ciphertext),
        };

        match crypto::decrypt_text(&key.symmetric_key, body) {
            Ok(text) => Some(text),
            Err(e) => {
                debug!(groop = %groop_id, version = key.version, error = %e, "message decryption failed");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Pairwise key wrapping
    // ------------------------------------------------------------------

    /// Seal the active group key so only the holder of `recipient_public_key`
    /// can open it, authenticated as coming from `sender_secret_key`.
    pub fn wrap_group_key_for_recipient(
        &self,
        groop_id: &GroopId,
        recipient_public_key: &[u8; 32],
        sender_secret_key: &[u8; 32],
    ) -> Option<String> {
        let key = self.active_group_key(groop_id)?;
        let payload = WrappedGroupKey {
            version: key.version,
            key: key.symmetric_key,
        };

        let result = bincode::serialize(&payload)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                crypto::seal_for_recipient(
                    sender_secret_key,
                    recipient_public_key,
                    groop_id.as_str().as_bytes(),
                    &bytes,
                )
                .map_err(|e| e.to_string())
            });

        match result {
            Ok(sealed) => Some(BASE64.encode(sealed)),
            Err(e) => {
                warn!(groop = %groop_id, error = %e, "failed to wrap group key");
                None
            }
        }
    }

    /// Open a wrapped key and store it for `groop_id`. On any failure returns
    /// `false` and leaves local state untouched.
    pub fn unwrap_group_key_from_sender(
        &self,
        wrapped_key: &str,
        sender_public_key: &[u8; 32],
        recipient_secret_key: &[u8; 32],
        groop_id: &GroopId,
    ) -> bool {
        let payload = match open_wrapped(wrapped_key, sender_public_key, recipient_secret_key, groop_id)
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(groop = %groop_id, error = %e, "failed to unwrap group key");
                return false;
            }
        };

        let key = GroupKey {
            groop_id: groop_id.clone(),
            symmetric_key: payload.key,
            version: payload.version,
            created_at: Utc::now(),
        };
        match self.db().store_group_key(&key) {
            Ok(KeyStoreOutcome::Conflict) => {
                warn!(groop = %groop_id, version = key.version, "received key clashes with a stored version");
                false
            }
            Ok(outcome) => {
                info!(groop = %groop_id, version = key.version, ?outcome, "stored received group key");
                true
            }
            Err(e) => {
                warn!(groop = %groop_id, error = %e, "failed to store received group key");
                false
            }
        }
    }
}

fn open_wrapped(
    wrapped_key: &str,
    sender_public_key: &[u8; 32],
    recipient_secret_key: &[u8; 32],
    groop_id: &GroopId,
) -> Result<WrappedGroupKey, String> {
    let sealed = BASE64.decode(wrapped_key).map_err(|e| e.to_string())?;
    let bytes = crypto::open_from_sender(
        recipient_secret_key,
        sender_public_key,
        groop_id.as_str().as_bytes(),
        &sealed,
    )
    .map_err(|e| e.to_string())?;
    bincode::deserialize(&bytes).map_err(|e| e.to_string())
}

fn split_versioned(ciphertext: &str) -> Option<(u32, &str)> {
    let (version, body) = ciphertext.split_once(CIPHERTEXT_VERSION_SEPARATOR)?;
    Some((version.parse().ok()?, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoEntropy;

    impl EntropySource for NoEntropy {
        fn is_available(&self) -> bool {
            false
        }
    }

    fn manager() -> KeyManager {
        KeyManager::in_memory().unwrap()
    }

    #[test]
    fn test_keypair_is_created_once() {
        let km = manager();
        let user = UserId::from("alice");
        let first = km.get_or_create_user_keypair(&user).unwrap();
        let second = km.get_or_create_user_keypair(&user).unwrap();
        assert_eq!(first, second);
        assert_eq!(km.user_keypair(&user), Some(first));
    }

    #[test]
    fn test_generation_fails_fast_without_rng() {
        let km = KeyManager::with_entropy(Database::open_in_memory().unwrap(), NoEntropy);
        assert!(!km.check_secure_random_available());
        assert!(matches!(
            km.get_or_create_user_keypair(&UserId::from("alice")),
            Err(KeyError::CryptoUnavailable)
        ));
        assert!(matches!(
            km.generate_group_key(&GroopId::from("g")),
            Err(KeyError::CryptoUnavailable)
        ));
        assert!(!km.has_group_key(&GroopId::from("g")));
    }

    #[test]
    fn test_message_roundtrip() {
        let km = manager();
        let groop = GroopId::from("g");
        km.generate_group_key(&groop).unwrap();

        for text in ["hi", "", "Dinner at 8? 🍝", "a.b.c"] {
            let ct = km.encrypt_message(text, &groop).unwrap();
            assert_ne!(ct, text);
            assert_eq!(km.decrypt_message(&ct, &groop).as_deref(), Some(text));
        }
    }

    #[test]
    fn test_encrypt_without_key_is_none() {
        let km = manager();
        assert!(km.encrypt_message("hi", &GroopId::from("g")).is_none());
    }

    #[test]
    fn test_decrypt_garbage_is_none() {
        let km = manager();
        let groop = GroopId::from("g");
        km.generate_group_key(&groop).unwrap();
        assert!(km.decrypt_message("1.!!!", &groop).is_none());
        assert!(km.decrypt_message("not even close", &groop).is_none());
        assert!(km.decrypt_message("99.AAAA", &groop).is_none());
    }

    #[test]
    fn test_history_survives_rotation() {
        let km = manager();
        let groop = GroopId::from("g");
        km.generate_group_key(&groop).unwrap();
        let before = km.encrypt_message("before rotation", &groop).unwrap();

        let rotated = km.generate_group_key(&groop).unwrap();
        assert_eq!(rotated.version, 2);
        let after = km.encrypt_message("after rotation", &groop).unwrap();

        assert_eq!(km.decrypt_message(&before, &groop).as_deref(), Some("before rotation"));
        assert_eq!(km.decrypt_message(&after, &groop).as_deref(), Some("after rotation"));
        assert_eq!(km.key_versions(&groop), vec![2, 1]);
    }

    #[test]
    fn test_generation_skips_versions_known_remotely() {
        let km = manager();
        let groop = GroopId::from("g");
        km.generate_group_key(&groop).unwrap();

        let key = km.generate_group_key_after(&groop, Some(4)).unwrap();
        assert_eq!(key.version, 5);
        // A stale remote version never pulls the number down
        assert_eq!(km.generate_group_key_after(&groop, Some(2)).unwrap().version, 6);
        assert_eq!(km.key_versions(&groop), vec![6, 5, 1]);
    }

    #[test]
    fn test_wrap_unwrap_between_devices() {
        let alice_device = manager();
        let bob_device = manager();
        let groop = GroopId::from("g");

        let alice = alice_device.get_or_create_user_keypair(&UserId::from("alice")).unwrap();
        let bob = bob_device.get_or_create_user_keypair(&UserId::from("bob")).unwrap();
        alice_device.generate_group_key(&groop).unwrap();

        let wrapped = alice_device
            .wrap_group_key_for_recipient(&groop, &bob.public_key, &alice.secret_key)
            .unwrap();
        assert!(bob_device.unwrap_group_key_from_sender(
            &wrapped,
            &alice.public_key,
            &bob.secret_key,
            &groop
        ));

        let ct = alice_device.encrypt_message("see you at the airport", &groop).unwrap();
        assert_eq!(
            bob_device.decrypt_message(&ct, &groop).as_deref(),
            Some("see you at the airport")
        );
    }

    #[test]
    fn test_failed_unwrap_leaves_state_untouched() {
        let alice_device = manager();
        let bob_device = manager();
        let groop = GroopId::from("g");

        let alice = alice_device.get_or_create_user_keypair(&UserId::from("alice")).unwrap();
        let bob = bob_device.get_or_create_user_keypair(&UserId::from("bob")).unwrap();
        let eve = bob_device.get_or_create_user_keypair(&UserId::from("eve")).unwrap();
        alice_device.generate_group_key(&groop).unwrap();

        let wrapped = alice_device
            .wrap_group_key_for_recipient(&groop, &bob.public_key, &alice.secret_key)
            .unwrap();

        // Opened by the wrong recipient
        assert!(!bob_device.unwrap_group_key_from_sender(&wrapped, &alice.public_key, &eve.secret_key, &groop));
        // Opened for the wrong group
        assert!(!bob_device.unwrap_group_key_from_sender(
            &wrapped,
            &alice.public_key,
            &bob.secret_key,
            &GroopId::from("other")
        ));
        assert!(!bob_device.unwrap_group_key_from_sender("%%%", &alice.public_key, &bob.secret_key, &groop));
        assert!(!bob_device.has_group_key(&groop));
    }

    #[test]
    fn test_wrap_without_key_is_none() {
        let km = manager();
        let kp = km.get_or_create_user_keypair(&UserId::from("alice")).unwrap();
        assert!(km
            .wrap_group_key_for_recipient(&GroopId::from("g"), &kp.public_key, &kp.secret_key)
            .is_none());
    }

    #[test]
    fn test_keys_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let groop = GroopId::from("g");

        let ct = {
            let km = KeyManager::new(Database::open_at(&path).unwrap());
            km.generate_group_key(&groop).unwrap();
            km.encrypt_message("persisted", &groop).unwrap()
        };

        let km = KeyManager::new(Database::open_at(&path).unwrap());
        assert_eq!(km.decrypt_message(&ct, &groop).as_deref(), Some("persisted"));
    }
}
