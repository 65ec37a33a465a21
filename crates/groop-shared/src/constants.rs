/// Application name
pub const APP_NAME: &str = "Groop";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Separator between the key version and the body of a message ciphertext
pub const CIPHERTEXT_VERSION_SEPARATOR: char = '.';

/// Text shown in place of a message body that could not be decrypted
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "🔒 Unable to decrypt this message";

/// Notification preview used for encrypted groups (never the plaintext)
pub const ENCRYPTED_NOTIFICATION_PREVIEW: &str = "New encrypted message";

/// Prefix of client-synthesized ids for optimistic messages
pub const OPTIMISTIC_ID_PREFIX: &str = "temp-";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_KEY_WRAP: &str = "groop-group-key-wrap-v1";
