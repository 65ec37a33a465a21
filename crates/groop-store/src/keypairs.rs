//! CRUD operations for [`UserKeyPair`] records.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use groop_shared::{UserId, UserKeyPair};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Insert a keypair. An existing keypair for the same user is kept, since
    /// identity keys are never rotated; the stored keypair is returned.
    pub fn insert_keypair_if_absent(&self, keypair: &UserKeyPair) -> Result<UserKeyPair> {
        self.conn().execute(
            "INSERT OR IGNORE INTO user_keypairs (user_id, public_key_hex, secret_key_hex, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                keypair.user_id.as_str(),
                hex::encode(keypair.public_key),
                hex::encode(keypair.secret_key),
                Utc::now().to_rfc3339(),
            ],
        )?;

        self.get_keypair(&keypair.user_id)?.ok_or(StoreError::NotFound)
    }

    pub fn get_keypair(&self, user_id: &UserId) -> Result<Option<UserKeyPair>> {
        let row = self
            .conn()
            .query_row(
                "SELECT public_key_hex, secret_key_hex FROM user_keypairs WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((public_hex, secret_hex)) = row else {
            return Ok(None);
        };

        let public_key = decode_key(&public_hex, user_id.as_str())?;
        let secret_key = decode_key(&secret_hex, user_id.as_str())?;
        let keypair = UserKeyPair::from_secret_bytes(user_id.clone(), secret_key);
        if keypair.public_key != public_key {
            return Err(StoreError::CorruptKey(user_id.to_string()));
        }
        Ok(Some(keypair))
    }

    /// Local accounts that hold a keypair on this device.
    pub fn list_keypair_users(&self) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM user_keypairs ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut users = Vec::new();
        for row in rows {
            users.push(UserId(row?));
        }
        Ok(users)
    }
}

pub(crate) fn decode_key(hex_str: &str, owner: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|_| StoreError::CorruptKey(owner.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_insert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::from("alice");

        let first = UserKeyPair::generate(user.clone()).unwrap();
        let second = UserKeyPair::generate(user.clone()).unwrap();

        let stored = db.insert_keypair_if_absent(&first).unwrap();
        assert_eq!(stored, first);

        // A second insert does not replace the device identity
        let stored = db.insert_keypair_if_absent(&second).unwrap();
        assert_eq!(stored, first);
        assert_eq!(db.list_keypair_users().unwrap(), vec![user]);
    }

    #[test]
    fn test_missing_keypair_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_keypair(&UserId::from("nobody")).unwrap().is_none());
    }

    #[test]
    fn test_mismatched_public_key_is_corrupt() {
        let db = Database::open_in_memory().unwrap();
        let kp = UserKeyPair::generate(UserId::from("alice")).unwrap();
        db.insert_keypair_if_absent(&kp).unwrap();
        db.conn()
            .execute(
                "UPDATE user_keypairs SET public_key_hex = ?1",
                params![hex::encode([7u8; 32])],
            )
            .unwrap();

        assert!(matches!(
            db.get_keypair(&kp.user_id),
            Err(StoreError::CorruptKey(_))
        ));
    }
}
