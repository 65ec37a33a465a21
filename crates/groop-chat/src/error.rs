use groop_shared::{CryptoError, GroopId, UserId};
use groop_store::StoreError;
use thiserror::Error;

/// Errors reported by the remote backing store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    /// A conditional write lost against a concurrent writer.
    #[error("Write conflict: {0}")]
    Conflict(String),
}

/// Failures of the local key layer.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Secure random number generator unavailable")]
    CryptoUnavailable,

    #[error("Key storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Error, Debug)]
pub enum ChatError {
    /// No secure RNG; every key operation is blocked.
    #[error("Secure random number generator unavailable")]
    CryptoUnavailable,

    #[error("No local key for group {0}")]
    KeyMissing(GroopId),

    #[error("No local keypair for user {0}")]
    LocalIdentityMissing(UserId),

    /// Recipient has not published a usable public key yet.
    #[error("User {0} has no published public key")]
    PeerKeyMissing(UserId),

    #[error("Failed to wrap group key for {0}")]
    KeyWrapFailed(UserId),

    #[error("User {user_id} is not a member of group {groop_id}")]
    NotAMember { groop_id: GroopId, user_id: UserId },

    #[error("Group not found: {0}")]
    GroupNotFound(GroopId),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Key storage error: {0}")]
    KeyStore(#[from] StoreError),
}

impl From<KeyError> for ChatError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::CryptoUnavailable | KeyError::Crypto(CryptoError::RandomUnavailable) => {
                ChatError::CryptoUnavailable
            }
            KeyError::Storage(e) => ChatError::KeyStore(e),
            KeyError::Crypto(e) => ChatError::KeyStore(StoreError::CorruptKey(e.to_string())),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;
