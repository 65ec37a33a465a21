use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Public key is not usable for key agreement")]
    InvalidPublicKey,

    #[error("Secure random number generator unavailable")]
    RandomUnavailable,
}
