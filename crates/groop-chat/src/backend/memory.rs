//! In-process [`RemoteStore`] used by tests and the simulator.
//!
//! Behaves like the hosted document store as far as the chat core can tell:
//! server timestamps are strictly increasing, live subscribers receive
//! per-document change events, and the key exchange transition is
//! conditional. Fault switches let tests fail individual write paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use groop_shared::{GroopId, MessageId, UserId};

use super::{ChangeStream, MessageQuery, RemoteStore};
use crate::error::BackendError;
use crate::model::{
    ChangeKind, DocChange, GroopRecord, KeyExchangeRecord, KeyExchangeStatus, MessageDoc,
    NewMessage, NotificationRecord, UserRecord,
};

type ChangeSender = mpsc::UnboundedSender<Result<Vec<DocChange>, BackendError>>;

struct Subscriber {
    since: Option<DateTime<Utc>>,
    tx: ChangeSender,
}

impl Subscriber {
    fn wants(&self, doc: &MessageDoc) -> bool {
        self.since.map_or(true, |since| doc.created_at >= since)
    }
}

struct GroopData {
    record: GroopRecord,
    messages: HashMap<MessageId, MessageDoc>,
    key_exchanges: Vec<KeyExchangeRecord>,
    subscribers: Vec<Subscriber>,
}

impl GroopData {
    fn broadcast(&mut self, changes: &[DocChange]) {
        self.subscribers.retain(|sub| {
            let matching: Vec<DocChange> = changes
                .iter()
                .filter(|c| sub.wants(&c.doc))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !sub.tx.is_closed();
            }
            sub.tx.send(Ok(matching)).is_ok()
        });
    }
}

#[derive(Default)]
struct Faults {
    fail_message_writes: bool,
    fail_reaction_writes: bool,
    deny_subscriptions: bool,
    fail_key_exchanges_to: HashSet<UserId>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, UserRecord>,
    groops: HashMap<GroopId, GroopData>,
    notifications: Vec<NotificationRecord>,
    last_timestamp: Option<DateTime<Utc>>,
    faults: Faults,
}

impl Inner {
    fn groop_mut(&mut self, groop_id: &GroopId) -> Result<&mut GroopData, BackendError> {
        self.groops
            .get_mut(groop_id)
            .ok_or_else(|| BackendError::NotFound(format!("groops/{groop_id}")))
    }

    fn user_mut(&mut self, user_id: &UserId) -> Result<&mut UserRecord, BackendError> {
        self.users
            .get_mut(user_id)
            .ok_or_else(|| BackendError::NotFound(format!("users/{user_id}")))
    }

    /// Strictly increasing server clock.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn put_user(&self, user: UserRecord) {
        self.lock().users.insert(user.id.clone(), user);
    }

    pub fn create_groop(&self, record: GroopRecord) {
        self.lock().groops.insert(
            record.id.clone(),
            GroopData {
                record,
                messages: HashMap::new(),
                key_exchanges: Vec::new(),
                subscribers: Vec::new(),
            },
        );
    }

    pub fn add_member(&self, groop_id: &GroopId, user_id: &UserId) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let groop = inner.groop_mut(groop_id)?;
        if !groop.record.is_member(user_id) {
            groop.record.members.push(user_id.clone());
        }
        Ok(())
    }

    /// Insert a fully-formed document (explicit id and timestamp) and notify
    /// subscribers, as if another client had written it.
    pub fn insert_message_doc(&self, groop_id: &GroopId, doc: MessageDoc) -> Result<(), BackendError> {
        let mut inner = self.lock();
        if inner.last_timestamp.map_or(true, |last| doc.created_at > last) {
            inner.last_timestamp = Some(doc.created_at);
        }
        let groop = inner.groop_mut(groop_id)?;
        let kind = if groop.messages.contains_key(&doc.id) {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        groop.messages.insert(doc.id.clone(), doc.clone());
        groop.broadcast(&[DocChange { kind, doc }]);
        Ok(())
    }

    pub fn remove_message(&self, groop_id: &GroopId, message_id: &MessageId) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let groop = inner.groop_mut(groop_id)?;
        let doc = groop
            .messages
            .remove(message_id)
            .ok_or_else(|| BackendError::NotFound(format!("messages/{message_id}")))?;
        groop.broadcast(&[DocChange {
            kind: ChangeKind::Removed,
            doc,
        }]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    pub fn set_fail_message_writes(&self, fail: bool) {
        self.lock().faults.fail_message_writes = fail;
    }

    pub fn set_fail_reaction_writes(&self, fail: bool) {
        self.lock().faults.fail_reaction_writes = fail;
    }

    pub fn set_deny_subscriptions(&self, deny: bool) {
        self.lock().faults.deny_subscriptions = deny;
    }

    pub fn fail_key_exchanges_to(&self, recipient: &UserId) {
        self.lock()
            .faults
            .fail_key_exchanges_to
            .insert(recipient.clone());
    }

    /// Deliver a terminal error to every live subscriber of a group.
    pub fn break_subscriptions(&self, groop_id: &GroopId, error: BackendError) {
        let mut inner = self.lock();
        if let Some(groop) = inner.groops.get_mut(groop_id) {
            for sub in groop.subscribers.drain(..) {
                let _ = sub.tx.send(Err(error.clone()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn user(&self, user_id: &UserId) -> Option<UserRecord> {
        self.lock().users.get(user_id).cloned()
    }

    pub fn groop(&self, groop_id: &GroopId) -> Option<GroopRecord> {
        self.lock().groops.get(groop_id).map(|g| g.record.clone())
    }

    pub fn key_exchanges(&self, groop_id: &GroopId) -> Vec<KeyExchangeRecord> {
        self.lock()
            .groops
            .get(groop_id)
            .map(|g| g.key_exchanges.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self, groop_id: &GroopId) -> Vec<MessageDoc> {
        let mut docs: Vec<MessageDoc> = self
            .lock()
            .groops
            .get(groop_id)
            .map(|g| g.messages.values().cloned().collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        docs
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.lock().notifications.clone()
    }

    pub fn subscriber_count(&self, groop_id: &GroopId) -> usize {
        self.lock()
            .groops
            .get(groop_id)
            .map(|g| g.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>, BackendError> {
        Ok(self.lock().users.get(user_id).cloned())
    }

    async fn publish_public_key(
        &self,
        user_id: &UserId,
        public_key: &str,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let user = inner.user_mut(user_id)?;
        user.public_key = Some(public_key.to_string());
        user.needs_key_generation = false;
        Ok(())
    }

    async fn flag_needs_key_generation(&self, user_id: &UserId) -> Result<(), BackendError> {
        self.lock().user_mut(user_id)?.needs_key_generation = true;
        Ok(())
    }

    async fn get_groop(&self, groop_id: &GroopId) -> Result<Option<GroopRecord>, BackendError> {
        Ok(self.groop(groop_id))
    }

    async fn groops_for_member(&self, user_id: &UserId) -> Result<Vec<GroopId>, BackendError> {
        let mut ids: Vec<GroopId> = self
            .lock()
            .groops
            .values()
            .filter(|g| g.record.is_member(user_id))
            .map(|g| g.record.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn enable_encryption_if_disabled(
        &self,
        groop_id: &GroopId,
    ) -> Result<bool, BackendError> {
        let mut inner = self.lock();
        let groop = inner.groop_mut(groop_id)?;
        if groop.record.encryption_enabled {
            return Ok(false);
        }
        groop.record.encryption_enabled = true;
        Ok(true)
    }

    async fn record_key_rotation(
        &self,
        groop_id: &GroopId,
        version: u32,
        rotated_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let groop = inner.groop_mut(groop_id)?;
        if groop.record.key_version.is_some_and(|current| current > version) {
            return Ok(());
        }
        groop.record.key_rotated_at = Some(rotated_at);
        groop.record.key_version = Some(version);
        Ok(())
    }

    async fn set_last_read(
        &self,
        groop_id: &GroopId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let groop = inner.groop_mut(groop_id)?;
        groop.record.last_read.insert(user_id.clone(), at);
        Ok(())
    }

    async fn add_key_exchange(&self, record: &KeyExchangeRecord) -> Result<(), BackendError> {
        let mut inner = self.lock();
        if inner.faults.fail_key_exchanges_to.contains(&record.recipient_id) {
            return Err(BackendError::Transport(format!(
                "write to {} rejected",
                record.groop_id.key_exchanges_path()
            )));
        }
        let groop = inner.groop_mut(&record.groop_id)?;
        groop.key_exchanges.push(record.clone());
        Ok(())
    }

    async fn pending_key_exchanges(
        &self,
        groop_id: &GroopId,
        recipient_id: &UserId,
    ) -> Result<Vec<KeyExchangeRecord>, BackendError> {
        let mut inner = self.lock();
        let groop = inner.groop_mut(groop_id)?;
        Ok(groop
            .key_exchanges
            .iter()
            .filter(|r| &r.recipient_id == recipient_id && r.status == KeyExchangeStatus::Pending)
            .cloned()
            .collect())
    }

    async fn complete_key_exchange(
        &self,
        groop_id: &GroopId,
        record_id: &str,
        status: KeyExchangeStatus,
        processed_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let groop = inner.groop_mut(groop_id)?;
        let record = groop
            .key_exchanges
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| BackendError::NotFound(format!("keyExchanges/{record_id}")))?;
        if record.status != KeyExchangeStatus::Pending {
            return Err(BackendError::Conflict(format!(
                "keyExchanges/{record_id} already {:?}",
                record.status
            )));
        }
        record.status = status;
        record.processed_at = Some(processed_at);
        Ok(())
    }

    async fn query_messages(
        &self,
        groop_id: &GroopId,
        query: MessageQuery,
    ) -> Result<Vec<MessageDoc>, BackendError> {
        let mut inner = self.lock();
        let groop = inner.groop_mut(groop_id)?;
        let mut docs: Vec<MessageDoc> = groop
            .messages
            .values()
            .filter(|d| query.before.map_or(true, |before| d.created_at < before))
            .cloned()
            .collect();
        docs.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        docs.truncate(query.limit);
        Ok(docs)
    }

    async fn subscribe_messages(
        &self,
        groop_id: &GroopId,
        since: Option<DateTime<Utc>>,
    ) -> Result<ChangeStream, BackendError> {
        let mut inner = self.lock();
        if inner.faults.deny_subscriptions {
            return Err(BackendError::PermissionDenied(groop_id.messages_path()));
        }
        let groop = inner.groop_mut(groop_id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber { since, tx };

        let mut existing: Vec<MessageDoc> = groop
            .messages
            .values()
            .filter(|d| subscriber.wants(d))
            .cloned()
            .collect();
        existing.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        if !existing.is_empty() {
            let initial = existing
                .into_iter()
                .map(|doc| DocChange {
                    kind: ChangeKind::Added,
                    doc,
                })
                .collect();
            let _ = subscriber.tx.send(Ok(initial));
        }

        debug!(groop = %groop_id, ?since, "live subscription opened");
        groop.subscribers.push(subscriber);
        Ok(rx)
    }

    async fn add_message(
        &self,
        groop_id: &GroopId,
        message: NewMessage,
    ) -> Result<MessageDoc, BackendError> {
        let mut inner = self.lock();
        if inner.faults.fail_message_writes {
            return Err(BackendError::Transport(format!(
                "write to {} rejected",
                groop_id.messages_path()
            )));
        }
        // Validate the target before consuming a timestamp
        inner.groop_mut(groop_id)?;
        let created_at = inner.next_timestamp();
        let doc = message.into_doc(MessageId::generate(), created_at);

        let groop = inner.groop_mut(groop_id)?;
        groop.messages.insert(doc.id.clone(), doc.clone());
        groop.broadcast(&[DocChange {
            kind: ChangeKind::Added,
            doc: doc.clone(),
        }]);
        Ok(doc)
    }

    async fn set_reaction(
        &self,
        groop_id: &GroopId,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
        present: bool,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock();
        if inner.faults.fail_reaction_writes {
            return Err(BackendError::Transport("reaction write rejected".into()));
        }
        let groop = inner.groop_mut(groop_id)?;
        let doc = groop
            .messages
            .get_mut(message_id)
            .ok_or_else(|| BackendError::NotFound(format!("messages/{message_id}")))?;

        let users = doc.reactions.entry(emoji.to_string()).or_default();
        if present {
            if !users.contains(user_id) {
                users.push(user_id.clone());
            }
        } else {
            users.retain(|u| u != user_id);
            if users.is_empty() {
                doc.reactions.remove(emoji);
            }
        }

        let change = DocChange {
            kind: ChangeKind::Modified,
            doc: doc.clone(),
        };
        groop.broadcast(&[change]);
        Ok(())
    }

    async fn mark_read_by(
        &self,
        groop_id: &GroopId,
        message_ids: &[MessageId],
        user_id: &UserId,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let groop = inner.groop_mut(groop_id)?;
        let mut changes = Vec::new();
        for id in message_ids {
            if let Some(doc) = groop.messages.get_mut(id) {
                if !doc.read.contains(user_id) {
                    doc.read.push(user_id.clone());
                    changes.push(DocChange {
                        kind: ChangeKind::Modified,
                        doc: doc.clone(),
                    });
                }
            }
        }
        if !changes.is_empty() {
            groop.broadcast(&changes);
        }
        Ok(())
    }

    async fn add_notification(&self, record: NotificationRecord) -> Result<(), BackendError> {
        self.lock().notifications.push(record);
        Ok(())
    }
}
