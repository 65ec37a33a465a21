//! # groop-chat
//!
//! Encrypted real-time chat core for Groop trip groups.
//!
//! - [`KeyManager`]: device keypairs, the per-group key ring, message
//!   encryption and pairwise wrapping of group keys.
//! - [`KeyExchangeCoordinator`]: group encryption setup, key distribution on
//!   join, inbox processing and rotation over the shared backing store.
//! - [`MessageSyncEngine`]: live, delta-synchronized, decrypted message feed
//!   with cursor pagination.
//! - [`ChatSession`]: per-conversation controller merging the synced feed with
//!   optimistic sends and exposing a single reactive [`ChatView`].
//!
//! The backing store is reached only through the [`RemoteStore`] trait;
//! [`MemoryStore`] implements it in process.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod key_exchange;
pub mod key_manager;
pub mod model;
pub mod render;
pub mod session;
pub mod sync;

pub use backend::memory::MemoryStore;
pub use backend::RemoteStore;
pub use config::ChatConfig;
pub use context::ChatContext;
pub use error::{BackendError, ChatError, KeyError};
pub use key_exchange::{KeyExchangeCoordinator, KeyExchangeReport, RotationReport, ShareFailure};
pub use key_manager::{EntropySource, KeyManager, OsEntropy};
pub use model::*;
pub use render::ChatItem;
pub use session::{ChatSession, ChatView, Reply, SessionUser};
pub use sync::{MessageSyncEngine, OlderPage, SyncBatch, SyncSubscription};
