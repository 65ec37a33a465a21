//! Live, decrypted view of a group's message collection.
//!
//! A subscription starts with an initial load of the newest page, then
//! follows the store's change feed from the oldest loaded timestamp forward.
//! Every batch is decrypted in arrival order, merged into an `id -> Message`
//! map and handed to the caller as the full ascending list plus the raw
//! changes.
//!
//! The feed replays the loaded page once when it starts. Documents identical
//! to what was already decoded are not decrypted again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use groop_shared::constants::UNDECRYPTABLE_PLACEHOLDER;
use groop_shared::{GroopId, MessageId};

use crate::backend::{MessageQuery, RemoteStore};
use crate::error::{ChatError, Result};
use crate::key_manager::KeyManager;
use crate::model::{
    sort_messages, ChangeKind, DocChange, Message, MessageChange, MessageDoc,
};

/// What a subscriber receives for every delivered batch.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    /// Every known message, ascending by `created_at`, unique by id.
    pub messages: Vec<Message>,
    /// The decrypted changes that produced this state.
    pub changes: Vec<MessageChange>,
    /// Oldest `created_at` seen so far; the cursor for "load older".
    pub oldest_timestamp: Option<DateTime<Utc>>,
}

/// One page of history older than a cursor.
#[derive(Debug, Clone)]
pub struct OlderPage {
    /// Ascending by `created_at`.
    pub messages: Vec<Message>,
    /// Cursor for the next request; unchanged when the page is empty.
    pub next_cursor: DateTime<Utc>,
    /// Fewer rows than requested came back.
    pub exhausted: bool,
}

#[derive(Default)]
struct SyncState {
    messages: HashMap<MessageId, Message>,
    docs: HashMap<MessageId, MessageDoc>,
    oldest: Option<DateTime<Utc>>,
}

impl SyncState {
    /// The decoded message for `doc` if it is unchanged since it was last
    /// decoded and that decode succeeded.
    fn reusable(&self, doc: &MessageDoc) -> Option<&Message> {
        if self.docs.get(&doc.id) != Some(doc) {
            return None;
        }
        self.messages
            .get(&doc.id)
            .filter(|m| m.is_decrypted != Some(false))
    }

    fn apply(&mut self, changes: Vec<MessageChange>) -> SyncBatch {
        for change in &changes {
            let created_at = change.message.created_at;
            self.oldest = Some(self.oldest.map_or(created_at, |o| o.min(created_at)));
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    self.messages
                        .insert(change.message.id.clone(), change.message.clone());
                }
                ChangeKind::Removed => {
                    self.messages.remove(&change.message.id);
                }
            }
        }

        let mut messages: Vec<Message> = self.messages.values().cloned().collect();
        sort_messages(&mut messages);
        SyncBatch {
            messages,
            changes,
            oldest_timestamp: self.oldest,
        }
    }
}

/// Handle to a running subscription. Dropping it tears the subscription down.
pub struct SyncSubscription {
    groop_id: GroopId,
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SyncSubscription {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop delivery. A batch still being decrypted is discarded.
    pub fn unsubscribe(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!(groop = %self.groop_id, "unsubscribed");
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SyncSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[derive(Clone)]
pub struct MessageSyncEngine {
    store: Arc<dyn RemoteStore>,
    keys: Arc<KeyManager>,
    page_size: usize,
}

impl MessageSyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, keys: Arc<KeyManager>, page_size: usize) -> Self {
        Self {
            store,
            keys,
            page_size,
        }
    }

    /// Turn a stored document into the client view, decrypting when needed.
    /// A body that cannot be decrypted is replaced by a fixed placeholder.
    pub fn decode_message(&self, groop_id: &GroopId, doc: MessageDoc) -> Message {
        let (text, reply_to_text, is_decrypted) = if doc.is_encrypted {
            match self.keys.decrypt_message(&doc.text, groop_id) {
                Some(text) => {
                    let reply = doc.reply_to_text.as_deref().map(|r| {
                        self.keys
                            .decrypt_message(r, groop_id)
                            .unwrap_or_else(|| UNDECRYPTABLE_PLACEHOLDER.to_string())
                    });
                    (text, reply, Some(true))
                }
                None => {
                    debug!(groop = %groop_id, message = %doc.id, "message could not be decrypted");
                    let reply = doc
                        .reply_to_text
                        .as_ref()
                        .map(|_| UNDECRYPTABLE_PLACEHOLDER.to_string());
                    (UNDECRYPTABLE_PLACEHOLDER.to_string(), reply, Some(false))
                }
            }
        } else {
            (doc.text, doc.reply_to_text, None)
        };

        Message {
            id: doc.id,
            groop_id: groop_id.clone(),
            sender_id: doc.sender_id,
            sender_name: doc.sender_name,
            sender_avatar: doc.sender_avatar,
            text,
            is_encrypted: doc.is_encrypted,
            is_decrypted,
            created_at: doc.created_at,
            reactions: doc
                .reactions
                .into_iter()
                .filter(|(_, users)| !users.is_empty())
                .map(|(emoji, users)| (emoji, users.into_iter().collect()))
                .collect(),
            read: doc.read.into_iter().collect(),
            reply_to: doc.reply_to,
            reply_to_text,
            reply_to_sender_name: doc.reply_to_sender_name,
            image_url: doc.image_url,
            attachments: doc.attachments,
        }
    }

    // Sequential on purpose: log order follows arrival order
    fn decode_changes(
        &self,
        groop_id: &GroopId,
        state: &mut SyncState,
        changes: Vec<DocChange>,
    ) -> Vec<MessageChange> {
        let mut decoded = Vec::with_capacity(changes.len());
        let mut reused = 0usize;
        for DocChange { kind, doc } in changes {
            let message = match kind {
                ChangeKind::Removed => {
                    state.docs.remove(&doc.id);
                    self.decode_message(groop_id, doc)
                }
                ChangeKind::Added | ChangeKind::Modified => match state.reusable(&doc) {
                    Some(message) => {
                        reused += 1;
                        message.clone()
                    }
                    None => {
                        state.docs.insert(doc.id.clone(), doc.clone());
                        self.decode_message(groop_id, doc)
                    }
                },
            };
            decoded.push(MessageChange { kind, message });
        }
        if reused > 0 {
            debug!(groop = %groop_id, reused, "skipped unchanged documents");
        }
        decoded
    }

    /// Start following a group. `on_batch` runs once for the initial load and
    /// again for every change batch; `on_error` runs at most once, after which
    /// the subscription is over.
    ///
    /// Failures before the live feed is established are returned directly.
    pub async fn subscribe<F, E>(
        &self,
        groop_id: &GroopId,
        mut on_batch: F,
        on_error: E,
    ) -> Result<SyncSubscription>
    where
        F: FnMut(SyncBatch) + Send + 'static,
        E: FnOnce(ChatError) + Send + 'static,
    {
        let mut state = SyncState::default();

        // 1. Initial load, newest first
        let initial = self
            .store
            .query_messages(groop_id, MessageQuery::latest(self.page_size))
            .await
            .map_err(|e| ChatError::Subscription(e.to_string()))?;
        let initial: Vec<DocChange> = initial
            .into_iter()
            .rev()
            .map(|doc| DocChange {
                kind: ChangeKind::Added,
                doc,
            })
            .collect();
        let loaded = initial.len();
        let changes = self.decode_changes(groop_id, &mut state, initial);
        on_batch(state.apply(changes));

        // 2. Continuous mode from the oldest loaded message, so edits to
        // anything already on screen keep arriving
        let since = state.oldest;
        let mut stream = self
            .store
            .subscribe_messages(groop_id, since)
            .await
            .map_err(|e| ChatError::Subscription(e.to_string()))?;
        info!(groop = %groop_id, loaded, "message sync started");

        let active = Arc::new(AtomicBool::new(true));
        let engine = self.clone();
        let task_groop = groop_id.clone();
        let task_active = active.clone();

        let task = tokio::spawn(async move {
            let mut on_error = Some(on_error);
            while let Some(item) = stream.recv().await {
                if !task_active.load(Ordering::SeqCst) {
                    break;
                }
                match item {
                    Ok(changes) => {
                        let changes = engine.decode_changes(&task_groop, &mut state, changes);
                        if !task_active.load(Ordering::SeqCst) {
                            debug!(groop = %task_groop, "discarding batch after teardown");
                            break;
                        }
                        on_batch(state.apply(changes));
                    }
                    Err(e) => {
                        warn!(groop = %task_groop, error = %e, "message subscription failed");
                        task_active.store(false, Ordering::SeqCst);
                        if let Some(report) = on_error.take() {
                            report(ChatError::Subscription(e.to_string()));
                        }
                        break;
                    }
                }
            }
            task_active.store(false, Ordering::SeqCst);
        });

        Ok(SyncSubscription {
            groop_id: groop_id.clone(),
            active,
            task: Some(task),
        })
    }

    /// Messages strictly older than `cursor`, ascending. Does not affect any
    /// live subscription.
    pub async fn fetch_older_messages(
        &self,
        groop_id: &GroopId,
        cursor: DateTime<Utc>,
        limit: usize,
    ) -> Result<OlderPage> {
        if limit == 0 {
            return Ok(OlderPage {
                messages: Vec::new(),
                next_cursor: cursor,
                exhausted: true,
            });
        }

        let docs = self
            .store
            .query_messages(groop_id, MessageQuery::before(cursor, limit))
            .await?;
        let exhausted = docs.len() < limit;

        let mut messages: Vec<Message> = docs
            .into_iter()
            .rev()
            .map(|doc| self.decode_message(groop_id, doc))
            .collect();
        sort_messages(&mut messages);

        let next_cursor = messages
            .first()
            .map(|m| m.created_at.min(cursor))
            .unwrap_or(cursor);

        debug!(groop = %groop_id, count = messages.len(), exhausted, "fetched older messages");
        Ok(OlderPage {
            messages,
            next_cursor,
            exhausted,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use chrono::TimeZone;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::error::BackendError;
    use crate::model::{GroopRecord, NewMessage};
    use groop_shared::UserId;

    fn setup() -> (Arc<MemoryStore>, Arc<KeyManager>, MessageSyncEngine, GroopId) {
        let store = Arc::new(MemoryStore::new());
        let keys = Arc::new(KeyManager::in_memory().unwrap());
        let groop = GroopId::from("porto");
        store.create_groop(GroopRecord::new(
            groop.clone(),
            "Porto",
            vec![UserId::from("alice"), UserId::from("bob")],
        ));
        let engine = MessageSyncEngine::new(store.clone(), keys.clone(), 3);
        (store, keys, engine, groop)
    }

    fn plain(text: &str) -> NewMessage {
        NewMessage {
            text: text.into(),
            is_encrypted: false,
            sender_id: UserId::from("bob"),
            sender_name: "Bob".into(),
            sender_avatar: None,
            reply_to: None,
            reply_to_text: None,
            reply_to_sender_name: None,
            image_url: None,
            attachments: Vec::new(),
        }
    }

    fn doc_at(id: &str, text: &str, secs: i64) -> MessageDoc {
        plain(text).into_doc(MessageId::from(id), Utc.timestamp_opt(secs, 0).unwrap())
    }

    async fn next_batch(rx: &mut mpsc::UnboundedReceiver<SyncBatch>) -> SyncBatch {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("batch channel closed")
    }

    fn assert_ordered(batch: &SyncBatch) {
        let ids: HashSet<_> = batch.messages.iter().map(|m| &m.id).collect();
        assert_eq!(ids.len(), batch.messages.len());
        for pair in batch.messages.windows(2) {
            assert!(pair[0].sort_key() < pair[1].sort_key());
        }
    }

    async fn subscribe(
        engine: &MessageSyncEngine,
        groop: &GroopId,
    ) -> (
        SyncSubscription,
        mpsc::UnboundedReceiver<SyncBatch>,
        mpsc::UnboundedReceiver<ChatError>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let sub = engine
            .subscribe(
                groop,
                move |batch| {
                    let _ = tx.send(batch);
                },
                move |err| {
                    let _ = err_tx.send(err);
                },
            )
            .await
            .unwrap();
        (sub, rx, err_rx)
    }

    #[tokio::test]
    async fn test_initial_load_is_newest_page_ascending() {
        let (store, _keys, engine, groop) = setup();
        for i in 0..5 {
            store.add_message(&groop, plain(&format!("m{i}"))).await.unwrap();
        }

        let (_sub, mut rx, _err) = subscribe(&engine, &groop).await;
        let batch = next_batch(&mut rx).await;

        let texts: Vec<_> = batch.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(batch.oldest_timestamp, Some(batch.messages[0].created_at));
        assert!(batch.changes.iter().all(|c| c.kind == ChangeKind::Added));
    }

    #[tokio::test]
    async fn test_batches_stay_ordered_and_unique() {
        let (store, _keys, engine, groop) = setup();
        store.insert_message_doc(&groop, doc_at("b", "second", 200)).unwrap();

        let (_sub, mut rx, _err) = subscribe(&engine, &groop).await;
        assert_ordered(&next_batch(&mut rx).await);
        // Replay of the loaded page by the live feed
        assert_ordered(&next_batch(&mut rx).await);

        store.insert_message_doc(&groop, doc_at("d", "fourth", 400)).unwrap();
        store.insert_message_doc(&groop, doc_at("c", "third", 300)).unwrap();
        store.insert_message_doc(&groop, doc_at("b", "second (edited)", 200)).unwrap();

        let mut last = None;
        for _ in 0..3 {
            let batch = next_batch(&mut rx).await;
            assert_ordered(&batch);
            last = Some(batch);
        }
        let last = last.unwrap();
        let texts: Vec<_> = last.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["second (edited)", "third", "fourth"]);
    }

    #[tokio::test]
    async fn test_removed_documents_leave_the_view() {
        let (store, _keys, engine, groop) = setup();
        let doc = store.add_message(&groop, plain("oops")).await.unwrap();

        let (_sub, mut rx, _err) = subscribe(&engine, &groop).await;
        next_batch(&mut rx).await;
        next_batch(&mut rx).await;

        store.remove_message(&groop, &doc.id).unwrap();
        let batch = next_batch(&mut rx).await;
        assert!(batch.messages.is_empty());
        assert_eq!(batch.changes[0].kind, ChangeKind::Removed);
        // The cursor still reflects what was seen
        assert_eq!(batch.oldest_timestamp, Some(doc.created_at));
    }

    #[tokio::test]
    async fn test_decrypt_miss_yields_placeholder() {
        let (store, _keys, engine, groop) = setup();
        let (_sub, mut rx, _err) = subscribe(&engine, &groop).await;
        next_batch(&mut rx).await;

        let mut msg = plain("1.Zm9yZWlnbiBjaXBoZXJ0ZXh0");
        msg.is_encrypted = true;
        store.add_message(&groop, msg).await.unwrap();

        let batch = next_batch(&mut rx).await;
        let message = &batch.messages[0];
        assert_eq!(message.text, UNDECRYPTABLE_PLACEHOLDER);
        assert_eq!(message.is_decrypted, Some(false));
        assert!(message.is_encrypted);
    }

    #[tokio::test]
    async fn test_encrypted_messages_are_decrypted() {
        let (store, keys, engine, groop) = setup();
        keys.generate_group_key(&groop).unwrap();

        let mut msg = plain(&keys.encrypt_message("pastel de nata?", &groop).unwrap());
        msg.is_encrypted = true;
        msg.reply_to_text = keys.encrypt_message("who is hungry", &groop);
        store.add_message(&groop, msg).await.unwrap();

        let (_sub, mut rx, _err) = subscribe(&engine, &groop).await;
        let batch = next_batch(&mut rx).await;
        let message = &batch.messages[0];
        assert_eq!(message.text, "pastel de nata?");
        assert_eq!(message.reply_to_text.as_deref(), Some("who is hungry"));
        assert_eq!(message.is_decrypted, Some(true));

        // Plaintext messages carry no decryption flag
        store.add_message(&groop, plain("plain")).await.unwrap();
        let batch = loop {
            let batch = next_batch(&mut rx).await;
            if batch.messages.len() == 2 {
                break batch;
            }
        };
        assert_eq!(batch.messages[1].is_decrypted, None);
    }

    #[tokio::test]
    async fn test_subscription_error_reported_once() {
        let (store, _keys, engine, groop) = setup();
        let (sub, mut rx, mut err_rx) = subscribe(&engine, &groop).await;
        next_batch(&mut rx).await;

        store.break_subscriptions(&groop, BackendError::PermissionDenied("revoked".into()));
        let err = tokio::time::timeout(Duration::from_secs(2), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, ChatError::Subscription(ref m) if m.contains("revoked")));

        tokio::task::yield_now().await;
        assert!(err_rx.try_recv().is_err());
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn test_denied_subscription_fails_to_start() {
        let (store, _keys, engine, groop) = setup();
        store.set_deny_subscriptions(true);
        let result = engine.subscribe(&groop, |_| {}, |_| {}).await;
        assert!(matches!(result, Err(ChatError::Subscription(_))));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (store, _keys, engine, groop) = setup();
        let (mut sub, mut rx, _err) = subscribe(&engine, &groop).await;
        next_batch(&mut rx).await;

        sub.unsubscribe();
        assert!(!sub.is_active());
        store.add_message(&groop, plain("after teardown")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(store.subscriber_count(&groop), 0);
    }

    #[tokio::test]
    async fn test_older_pages_never_overlap() {
        let (store, _keys, engine, groop) = setup();
        for i in 0..8 {
            store
                .insert_message_doc(&groop, doc_at(&format!("m{i}"), &format!("m{i}"), 100 + i))
                .unwrap();
        }

        let mut cursor = Utc.timestamp_opt(106, 0).unwrap();
        let mut seen = HashSet::new();
        let mut previous = cursor;
        loop {
            let page = engine.fetch_older_messages(&groop, cursor, 3).await.unwrap();
            for m in &page.messages {
                assert!(m.created_at < cursor);
                assert!(seen.insert(m.id.clone()), "repeated {}", m.id);
            }
            assert!(page.next_cursor <= previous);
            previous = page.next_cursor;
            cursor = page.next_cursor;
            if page.exhausted {
                break;
            }
        }
        assert_eq!(seen.len(), 6);
    }

    #[tokio::test]
    async fn test_older_page_on_empty_history() {
        let (_store, _keys, engine, groop) = setup();
        let cursor = Utc::now();
        let page = engine.fetch_older_messages(&groop, cursor, 10).await.unwrap();
        assert!(page.messages.is_empty());
        assert!(page.exhausted);
        assert_eq!(page.next_cursor, cursor);
    }

    #[tokio::test]
    async fn test_zero_limit_page_is_exhausted() {
        let (store, _keys, engine, groop) = setup();
        store.insert_message_doc(&groop, doc_at("a", "old", 100)).unwrap();

        let cursor = Utc.timestamp_opt(500, 0).unwrap();
        let page = engine.fetch_older_messages(&groop, cursor, 0).await.unwrap();
        assert!(page.messages.is_empty());
        assert!(page.exhausted);
        assert_eq!(page.next_cursor, cursor);
    }

    #[test]
    fn test_unchanged_replay_reuses_decoded_message() {
        let (store, keys, engine, groop) = setup();
        keys.generate_group_key(&groop).unwrap();
        let mut doc = doc_at("a", "", 100);
        doc.is_encrypted = true;
        doc.text = keys.encrypt_message("sealed", &groop).unwrap();
        let added = |doc: &MessageDoc| {
            vec![DocChange {
                kind: ChangeKind::Added,
                doc: doc.clone(),
            }]
        };

        let mut state = SyncState::default();
        engine.decode_changes(&groop, &mut state, added(&doc));

        // Without the key any fresh decode would give the placeholder
        let keyless = MessageSyncEngine::new(store, Arc::new(KeyManager::in_memory().unwrap()), 3);
        let replay = keyless.decode_changes(&groop, &mut state, added(&doc));
        assert_eq!(replay[0].message.text, "sealed");

        doc.read.push(UserId::from("bob"));
        let edited = keyless.decode_changes(&groop, &mut state, added(&doc));
        assert_eq!(edited[0].message.text, UNDECRYPTABLE_PLACEHOLDER);
    }
}
