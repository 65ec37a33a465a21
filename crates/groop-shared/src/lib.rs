//! # groop-shared
//!
//! Identifiers, constants and cryptographic primitives shared by the Groop
//! chat core and its device-local key store.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod keypair;
pub mod types;

pub use error::CryptoError;
pub use keypair::UserKeyPair;
pub use types::{GroopId, MessageId, UserId};
