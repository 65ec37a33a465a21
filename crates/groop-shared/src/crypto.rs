use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_KEY_WRAP, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Probe the OS random number generator without panicking.
pub fn secure_random_available() -> bool {
    let mut sample = [0u8; 32];
    rand::rngs::OsRng.try_fill_bytes(&mut sample).is_ok()
}

pub fn generate_symmetric_key() -> Result<SymmetricKey, CryptoError> {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng
        .try_fill_bytes(&mut key)
        .map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(key)
}

pub fn generate_nonce() -> Result<[u8; NONCE_SIZE], CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(nonce)
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce()?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt UTF-8 text and return it base64-encoded, ready for a string field.
pub fn encrypt_text(key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
    encrypt(key, plaintext.as_bytes()).map(|bytes| BASE64.encode(bytes))
}

pub fn decrypt_text(key: &SymmetricKey, encoded: &str) -> Result<String, CryptoError> {
    let data = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let plaintext = decrypt(key, &data)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

// BLAKE3 KDF with domain separation, bound to the group the key belongs to
pub fn derive_wrap_key(shared_secret: &[u8], groop_id: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_KEY_WRAP);
    hasher.update(shared_secret);
    hasher.update(groop_id);
    let hash = hasher.finalize();
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(&hash.as_bytes()[..SYMMETRIC_KEY_SIZE]);
    key
}

fn static_shared_key(
    own_secret: &[u8; 32],
    peer_public: &[u8; 32],
    groop_id: &[u8],
) -> Result<SymmetricKey, CryptoError> {
    let secret = StaticSecret::from(*own_secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }
    Ok(derive_wrap_key(shared.as_bytes(), groop_id))
}

/// Sender-authenticated encryption of `payload` for one recipient.
///
/// Both sides derive the same key from a static-static X25519 agreement, so
/// only the recipient can open the box and a successful open proves it was
/// sealed by the holder of `sender_secret`.
pub fn seal_for_recipient(
    sender_secret: &[u8; 32],
    recipient_public: &[u8; 32],
    groop_id: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = static_shared_key(sender_secret, recipient_public, groop_id)?;
    encrypt(&key, payload)
}

pub fn open_from_sender(
    recipient_secret: &[u8; 32],
    sender_public: &[u8; 32],
    groop_id: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = static_shared_key(recipient_secret, sender_public, groop_id)?;
    decrypt(&key, sealed)
}
