//! Documents exchanged with the backing store and the client-side message
//! model handed to the UI layer.
//!
//! Document structs use camelCase field names so they map one-to-one onto the
//! store's schema (`groops/{id}/messages/{id}`, `users/{id}`, ...).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use groop_shared::{GroopId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Directory records
// ---------------------------------------------------------------------------

/// `users/{userId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Base64 X25519 public key, published by the user's own device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Set by a peer that tried to share a key before one was published.
    #[serde(default)]
    pub needs_key_generation: bool,
    #[serde(default)]
    pub push_tokens: Vec<String>,
}

impl UserRecord {
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar_url: None,
            public_key: None,
            needs_key_generation: false,
            push_tokens: Vec::new(),
        }
    }
}

/// `groops/{groopId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroopRecord {
    pub id: GroopId,
    pub name: String,
    pub members: Vec<UserId>,
    #[serde(default)]
    pub encryption_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_rotated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
    /// Per-member "last read" watermark.
    #[serde(default)]
    pub last_read: HashMap<UserId, DateTime<Utc>>,
}

impl GroopRecord {
    pub fn new(id: GroopId, name: impl Into<String>, members: Vec<UserId>) -> Self {
        Self {
            id,
            name: name.into(),
            members,
            encryption_enabled: false,
            key_rotated_at: None,
            key_version: None,
            last_read: HashMap::new(),
        }
    }

    pub fn is_member(&self, user_id: &UserId) -> bool {
        self.members.contains(user_id)
    }
}

// ---------------------------------------------------------------------------
// Key exchange
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyExchangeStatus {
    Pending,
    Completed,
    Failed,
}

/// `groops/{groopId}/keyExchanges/{id}`: one wrapped copy of the group key
/// addressed to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeRecord {
    pub id: String,
    pub groop_id: GroopId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub encrypted_key: String,
    pub status: KeyExchangeStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// `groops/{groopId}/messages/{messageId}` as persisted.
///
/// `text` (and `replyToText`) hold ciphertext when `isEncrypted` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDoc {
    pub id: MessageId,
    pub text: String,
    pub is_encrypted: bool,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    /// Server-assigned.
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reactions: BTreeMap<String, Vec<UserId>>,
    #[serde(default)]
    pub read: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A message as written by a client; the store assigns `id` and `createdAt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub text: String,
    pub is_encrypted: bool,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl NewMessage {
    pub fn into_doc(self, id: MessageId, created_at: DateTime<Utc>) -> MessageDoc {
        MessageDoc {
            id,
            text: self.text,
            is_encrypted: self.is_encrypted,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            sender_avatar: self.sender_avatar,
            created_at,
            reactions: BTreeMap::new(),
            read: Vec::new(),
            reply_to: self.reply_to,
            reply_to_text: self.reply_to_text,
            reply_to_sender_name: self.reply_to_sender_name,
            image_url: self.image_url,
            attachments: self.attachments,
        }
    }
}

/// Client-side, decrypted view of a message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub groop_id: GroopId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub text: String,
    pub is_encrypted: bool,
    /// `None` for plaintext messages, otherwise whether decryption succeeded.
    pub is_decrypted: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub read: BTreeSet<UserId>,
    pub reply_to: Option<MessageId>,
    pub reply_to_text: Option<String>,
    pub reply_to_sender_name: Option<String>,
    pub image_url: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Ordering key used everywhere a message list is presented.
    pub fn sort_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.id)
    }

    /// Add or remove `user_id` under `emoji`, dropping empty emoji entries.
    pub fn set_reaction(&mut self, emoji: &str, user_id: &UserId, present: bool) {
        if present {
            self.reactions
                .entry(emoji.to_string())
                .or_default()
                .insert(user_id.clone());
        } else if let Some(users) = self.reactions.get_mut(emoji) {
            users.remove(user_id);
            if users.is_empty() {
                self.reactions.remove(emoji);
            }
        }
    }

    pub fn has_reaction(&self, emoji: &str, user_id: &UserId) -> bool {
        self.reactions
            .get(emoji)
            .is_some_and(|users| users.contains(user_id))
    }
}

/// Sort ascending by `created_at`, ties broken by id.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One per-document event from a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChange {
    pub kind: ChangeKind,
    pub doc: MessageDoc,
}

/// A change event after decryption, as handed to sync callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageChange {
    pub kind: ChangeKind,
    pub message: Message,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// `notifications/{id}`: fan-out request picked up by the push collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub groop_id: GroopId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub recipient_ids: Vec<UserId>,
    pub preview: String,
    pub tokens: Vec<String>,
}

// ---------------------------------------------------------------------------
// Optimistic operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Sending,
    Sent,
    Failed,
}

/// Client-local record of an in-flight send, keyed by the temporary id.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: MessageId,
    pub status: PendingStatus,
    pub timestamp: DateTime<Utc>,
    /// Id assigned by the store once the write succeeded.
    pub remote_id: Option<MessageId>,
    pub error: Option<String>,
}
