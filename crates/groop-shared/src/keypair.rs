use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{PUBKEY_SIZE, SECRET_KEY_SIZE};
use crate::error::CryptoError;
use crate::types::UserId;

/// A user's device-bound X25519 key agreement identity.
///
/// The public half is published to the user's directory record so that other
/// members can wrap group keys for them. The secret half never leaves the
/// device.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserKeyPair {
    pub user_id: UserId,
    pub public_key: [u8; PUBKEY_SIZE],
    pub secret_key: [u8; SECRET_KEY_SIZE],
}

impl UserKeyPair {
    /// Generate a new random keypair
    pub fn generate(user_id: UserId) -> Result<Self, CryptoError> {
        let mut seed = [0u8; SECRET_KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|_| CryptoError::RandomUnavailable)?;
        Ok(Self::from_secret_bytes(user_id, seed))
    }

    /// Restore a keypair from its secret key bytes
    pub fn from_secret_bytes(user_id: UserId, secret: [u8; SECRET_KEY_SIZE]) -> Self {
        let static_secret = StaticSecret::from(secret);
        let public_key = PublicKey::from(&static_secret).to_bytes();
        Self {
            user_id,
            public_key,
            secret_key: secret,
        }
    }

    /// Public key in the form stored on the user's directory record
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key)
    }
}

impl std::fmt::Debug for UserKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKeyPair")
            .field("user_id", &self.user_id)
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Parse a published public key (base64, 32 bytes).
pub fn decode_public_key(encoded: &str) -> Result<[u8; PUBKEY_SIZE], CryptoError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = UserKeyPair::generate(UserId::from("u1")).unwrap();
        assert_ne!(kp.public_key, [0u8; 32]);
        assert_ne!(kp.public_key, kp.secret_key);
    }

    #[test]
    fn test_keypair_restore_roundtrip() {
        let kp = UserKeyPair::generate(UserId::from("u1")).unwrap();
        let restored = UserKeyPair::from_secret_bytes(kp.user_id.clone(), kp.secret_key);
        assert_eq!(kp, restored);
    }

    #[test]
    fn test_public_key_encoding_roundtrip() {
        let kp = UserKeyPair::generate(UserId::from("u1")).unwrap();
        let decoded = decode_public_key(&kp.public_key_base64()).unwrap();
        assert_eq!(decoded, kp.public_key);
    }

    #[test]
    fn test_short_public_key_rejected() {
        let encoded = BASE64.encode([1u8; 16]);
        assert_eq!(
            decode_public_key(&encoded),
            Err(CryptoError::InvalidKeyLength)
        );
    }

    #[test]
    fn test_debug_does_not_print_secret() {
        let kp = UserKeyPair::generate(UserId::from("u1")).unwrap();
        let rendered = format!("{kp:?}");
        assert!(!rendered.contains(&hex::encode(kp.secret_key)));
    }
}
