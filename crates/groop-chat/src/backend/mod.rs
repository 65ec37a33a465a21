//! Contract with the remote real-time document store.
//!
//! The store owns replication and durability; the chat core only needs ordered
//! range queries on `createdAt`, equality / array-contains filters, a
//! conditional flag write, and a live subscription that yields per-document
//! `added` / `modified` / `removed` events.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use groop_shared::{GroopId, MessageId, UserId};

use crate::error::BackendError;
use crate::model::{
    DocChange, GroopRecord, KeyExchangeRecord, KeyExchangeStatus, MessageDoc, NewMessage,
    NotificationRecord, UserRecord,
};

/// Live change feed for one group's messages. An `Err` item is terminal.
pub type ChangeStream = mpsc::UnboundedReceiver<Result<Vec<DocChange>, BackendError>>;

/// Range query over a group's messages, always newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
    /// Only messages strictly older than this timestamp.
    ///
    /// The cursor is a bare `createdAt`. If a page ends inside a run of
    /// messages sharing one timestamp, the rest of that run is never
    /// returned by the next page.
    pub before: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl MessageQuery {
    pub fn latest(limit: usize) -> Self {
        Self { before: None, limit }
    }

    pub fn before(cursor: DateTime<Utc>, limit: usize) -> Self {
        Self {
            before: Some(cursor),
            limit,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    // -- users/{userId} ----------------------------------------------------

    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>, BackendError>;

    /// Set `publicKey` and clear `needsKeyGeneration`.
    async fn publish_public_key(
        &self,
        user_id: &UserId,
        public_key: &str,
    ) -> Result<(), BackendError>;

    async fn flag_needs_key_generation(&self, user_id: &UserId) -> Result<(), BackendError>;

    // -- groops/{groopId} --------------------------------------------------

    async fn get_groop(&self, groop_id: &GroopId) -> Result<Option<GroopRecord>, BackendError>;

    /// Groups whose `members` array contains `user_id`.
    async fn groops_for_member(&self, user_id: &UserId) -> Result<Vec<GroopId>, BackendError>;

    /// Compare-and-set `encryptionEnabled` from false to true. Returns whether
    /// this call performed the transition.
    async fn enable_encryption_if_disabled(&self, groop_id: &GroopId)
        -> Result<bool, BackendError>;

    /// Record `keyVersion` and `keyRotatedAt`. A version lower than the one
    /// already recorded is ignored.
    async fn record_key_rotation(
        &self,
        groop_id: &GroopId,
        version: u32,
        rotated_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    async fn set_last_read(
        &self,
        groop_id: &GroopId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    // -- groops/{groopId}/keyExchanges ---------------------------------------

    async fn add_key_exchange(&self, record: &KeyExchangeRecord) -> Result<(), BackendError>;

    /// `pending` records addressed to `recipient_id`.
    async fn pending_key_exchanges(
        &self,
        groop_id: &GroopId,
        recipient_id: &UserId,
    ) -> Result<Vec<KeyExchangeRecord>, BackendError>;

    /// One-way transition out of `pending`; a record already processed yields
    /// [`BackendError::Conflict`].
    async fn complete_key_exchange(
        &self,
        groop_id: &GroopId,
        record_id: &str,
        status: KeyExchangeStatus,
        processed_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    // -- groops/{groopId}/messages -----------------------------------------

    async fn query_messages(
        &self,
        groop_id: &GroopId,
        query: MessageQuery,
    ) -> Result<Vec<MessageDoc>, BackendError>;

    /// Live feed of changes to messages with `createdAt >= since` (all
    /// messages when `since` is `None`). The first batch lists the matching
    /// documents that already exist as `added`.
    async fn subscribe_messages(
        &self,
        groop_id: &GroopId,
        since: Option<DateTime<Utc>>,
    ) -> Result<ChangeStream, BackendError>;

    /// Persist a message; the store assigns `id` and `createdAt`.
    async fn add_message(
        &self,
        groop_id: &GroopId,
        message: NewMessage,
    ) -> Result<MessageDoc, BackendError>;

    async fn set_reaction(
        &self,
        groop_id: &GroopId,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
        present: bool,
    ) -> Result<(), BackendError>;

    async fn mark_read_by(
        &self,
        groop_id: &GroopId,
        message_ids: &[MessageId],
        user_id: &UserId,
    ) -> Result<(), BackendError>;

    // -- notifications -----------------------------------------------------

    async fn add_notification(&self, record: NotificationRecord) -> Result<(), BackendError>;
}
