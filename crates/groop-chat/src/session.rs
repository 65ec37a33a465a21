//! Per-conversation controller.
//!
//! A [`ChatSession`] merges three sources into one [`ChatView`]: the live
//! synced feed, pages of older history, and optimistic entries for sends that
//! are still in flight. The view is published through a `watch` channel so
//! any number of observers can follow it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, FixedOffset, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use groop_shared::constants::ENCRYPTED_NOTIFICATION_PREVIEW;
use groop_shared::{GroopId, MessageId, UserId};

use crate::context::ChatContext;
use crate::error::{BackendError, ChatError, Result};
use crate::model::{
    sort_messages, GroopRecord, Message, NewMessage, NotificationRecord, PendingOperation,
    PendingStatus,
};
use crate::render::{build_chat_items, compute_first_unread, ChatItem};
use crate::sync::{SyncBatch, SyncSubscription};

/// The signed-in user a session acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl SessionUser {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

/// The message a send is replying to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message_id: MessageId,
    pub text: String,
    pub sender_name: String,
}

impl From<&Message> for Reply {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            text: message.text.clone(),
            sender_name: message.sender_name.clone(),
        }
    }
}

/// Everything the UI renders for one conversation.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    /// Synced, historical and optimistic messages, ascending, unique by id.
    pub messages: Vec<Message>,
    pub items: Vec<ChatItem>,
    pub first_unread_id: Option<MessageId>,
    pub pending: Vec<PendingOperation>,
    pub oldest_cursor: Option<DateTime<Utc>>,
    pub loading_older: bool,
    pub has_more_history: bool,
    pub error: Option<String>,
}

impl ChatView {
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn pending_op(&self, id: &MessageId) -> Option<&PendingOperation> {
        self.pending.iter().find(|p| &p.id == id)
    }
}

#[derive(Default)]
struct SessionState {
    live: Vec<Message>,
    older: HashMap<MessageId, Message>,
    optimistic: Vec<Message>,
    pending: Vec<PendingOperation>,
    oldest_cursor: Option<DateTime<Utc>>,
    loading_older: bool,
    has_more_history: bool,
    first_unread_id: Option<MessageId>,
    marker_computed: bool,
    last_read: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl SessionState {
    fn synced(&self) -> Vec<Message> {
        let live_ids: HashSet<&MessageId> = self.live.iter().map(|m| &m.id).collect();
        let mut messages: Vec<Message> = self
            .older
            .values()
            .filter(|m| !live_ids.contains(&m.id))
            .cloned()
            .chain(self.live.iter().cloned())
            .collect();
        sort_messages(&mut messages);
        messages
    }

    fn synced_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        match self.live.iter_mut().find(|m| &m.id == id) {
            Some(message) => Some(message),
            None => self.older.get_mut(id),
        }
    }

    fn pending_mut(&mut self, id: &MessageId) -> Option<&mut PendingOperation> {
        self.pending.iter_mut().find(|p| &p.id == id)
    }

    fn merge_cursor(&mut self, candidate: Option<DateTime<Utc>>) {
        if let Some(candidate) = candidate {
            self.oldest_cursor = Some(self.oldest_cursor.map_or(candidate, |c| c.min(candidate)));
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    view_tx: watch::Sender<ChatView>,
    generation: AtomicU64,
    user_id: UserId,
    offset: FixedOffset,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Mutate state and republish, unless the session has moved on.
    fn update<R>(&self, generation: u64, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let mut state = self.lock();
        if !self.is_current(generation) {
            return None;
        }
        let result = f(&mut state);
        self.view_tx.send_replace(self.build_view(&state));
        Some(result)
    }

    fn build_view(&self, state: &SessionState) -> ChatView {
        let mut messages = state.synced();
        let synced_ids: HashSet<MessageId> = messages.iter().map(|m| m.id.clone()).collect();

        // A confirmed send whose copy has already synced is not shown twice
        let confirmed: HashSet<&MessageId> = state
            .pending
            .iter()
            .filter(|p| p.remote_id.as_ref().is_some_and(|r| synced_ids.contains(r)))
            .map(|p| &p.id)
            .collect();
        messages.extend(
            state
                .optimistic
                .iter()
                .filter(|m| !confirmed.contains(&m.id))
                .cloned(),
        );
        sort_messages(&mut messages);

        let mut pending = state.pending.clone();
        pending.sort_by_key(|p| p.timestamp);

        ChatView {
            items: build_chat_items(&messages, self.offset),
            messages,
            first_unread_id: state.first_unread_id.clone(),
            pending,
            oldest_cursor: state.oldest_cursor,
            loading_older: state.loading_older,
            has_more_history: state.has_more_history,
            error: state.error.clone(),
        }
    }

    fn on_batch(&self, generation: u64, page_size: usize, batch: SyncBatch) {
        let user_id = self.user_id.clone();
        self.update(generation, |state| {
            if !state.marker_computed {
                state.has_more_history = batch.messages.len() >= page_size;
            }
            state.live = batch.messages;
            state.merge_cursor(batch.oldest_timestamp);

            if !state.marker_computed {
                state.first_unread_id = compute_first_unread(&state.live, &user_id, state.last_read);
                state.marker_computed = true;
            }
        });
    }
}

pub struct ChatSession {
    ctx: Arc<ChatContext>,
    groop_id: GroopId,
    user: SessionUser,
    shared: Arc<Shared>,
    generation: u64,
    subscription: Mutex<Option<SyncSubscription>>,
}

impl ChatSession {
    /// Authorize, recover a missing key if possible, and start syncing.
    pub async fn open(ctx: Arc<ChatContext>, groop_id: GroopId, user: SessionUser) -> Result<Self> {
        let groop = fetch_membership(&ctx, &groop_id, &user.id).await?;

        if groop.encryption_enabled && !ctx.keys.has_group_key(&groop_id) {
            match ctx.key_exchange.process_pending_key_exchanges(&user.id).await {
                Ok(report) if report.received_key_for(&groop_id) => {
                    info!(groop = %groop_id, "recovered group key from pending exchange");
                }
                Ok(_) => warn!(groop = %groop_id, "no group key available, history will not decrypt"),
                Err(e) => warn!(groop = %groop_id, error = %e, "key recovery failed"),
            }
        }

        let state = SessionState {
            last_read: groop.last_read.get(&user.id).copied(),
            ..SessionState::default()
        };
        let (view_tx, _) = watch::channel(ChatView::default());
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            view_tx,
            generation: AtomicU64::new(0),
            user_id: user.id.clone(),
            offset: ctx.config.utc_offset,
        });
        let generation = 0;

        let on_batch = {
            let shared = shared.clone();
            let page_size = ctx.config.page_size;
            move |batch: SyncBatch| shared.on_batch(generation, page_size, batch)
        };
        let on_error = {
            let shared = shared.clone();
            move |err: ChatError| {
                shared.update(generation, |state| state.error = Some(err.to_string()));
            }
        };
        let subscription = ctx.sync.subscribe(&groop_id, on_batch, on_error).await?;

        info!(groop = %groop_id, user = %user.id, "chat session opened");
        Ok(Self {
            ctx,
            groop_id,
            user,
            shared,
            generation,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn groop_id(&self) -> &GroopId {
        &self.groop_id
    }

    /// A receiver that observes every published view.
    pub fn view(&self) -> watch::Receiver<ChatView> {
        self.shared.view_tx.subscribe()
    }

    pub fn snapshot(&self) -> ChatView {
        self.shared.view_tx.borrow().clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        self.shared.update(self.generation, f)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_current(self.generation) {
            Ok(())
        } else {
            Err(ChatError::Subscription("session closed".into()))
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a message with an optimistic local echo. Returns the id the
    /// store assigned.
    pub async fn send_message(&self, text: &str, reply: Option<Reply>) -> Result<MessageId> {
        self.ensure_open()?;
        let groop = fetch_membership(&self.ctx, &self.groop_id, &self.user.id).await?;

        let temp_id = MessageId::optimistic();
        let now = Utc::now();
        let echo = Message {
            id: temp_id.clone(),
            groop_id: self.groop_id.clone(),
            sender_id: self.user.id.clone(),
            sender_name: self.user.display_name.clone(),
            sender_avatar: self.user.avatar_url.clone(),
            text: text.to_string(),
            // Settled once the outgoing message is prepared
            is_encrypted: false,
            is_decrypted: None,
            created_at: now,
            reactions: Default::default(),
            read: Default::default(),
            reply_to: reply.as_ref().map(|r| r.message_id.clone()),
            reply_to_text: reply.as_ref().map(|r| r.text.clone()),
            reply_to_sender_name: reply.as_ref().map(|r| r.sender_name.clone()),
            image_url: None,
            attachments: Vec::new(),
        };
        self.update(|state| {
            state.optimistic.push(echo);
            state.pending.push(PendingOperation {
                id: temp_id.clone(),
                status: PendingStatus::Sending,
                timestamp: now,
                remote_id: None,
                error: None,
            });
        });

        let outgoing = self.prepare_outgoing(&groop, text, reply.as_ref()).await;
        let is_encrypted = outgoing.is_encrypted;
        if is_encrypted {
            self.update(|state| {
                if let Some(echo) = state.optimistic.iter_mut().find(|m| m.id == temp_id) {
                    echo.is_encrypted = true;
                    echo.is_decrypted = Some(true);
                }
            });
        }

        match self.ctx.store.add_message(&self.groop_id, outgoing).await {
            Ok(doc) => {
                self.update(|state| {
                    if let Some(op) = state.pending_mut(&temp_id) {
                        op.status = PendingStatus::Sent;
                        op.remote_id = Some(doc.id.clone());
                    }
                });
                self.schedule_echo_removal(temp_id.clone());
                debug!(groop = %self.groop_id, id = %doc.id, encrypted = is_encrypted, "message sent");

                self.notify_members(&groop, &doc.id, text, is_encrypted).await;
                Ok(doc.id)
            }
            Err(e) => {
                warn!(groop = %self.groop_id, error = %e, "message send failed");
                self.update(|state| {
                    state.optimistic.retain(|m| m.id != temp_id);
                    if let Some(op) = state.pending_mut(&temp_id) {
                        op.status = PendingStatus::Failed;
                        op.error = Some(e.to_string());
                    }
                });
                Err(ChatError::SendFailed(e.to_string()))
            }
        }
    }

    async fn prepare_outgoing(
        &self,
        groop: &GroopRecord,
        text: &str,
        reply: Option<&Reply>,
    ) -> NewMessage {
        let mut message = NewMessage {
            text: text.to_string(),
            is_encrypted: false,
            sender_id: self.user.id.clone(),
            sender_name: self.user.display_name.clone(),
            sender_avatar: self.user.avatar_url.clone(),
            reply_to: reply.map(|r| r.message_id.clone()),
            reply_to_text: reply.map(|r| r.text.clone()),
            reply_to_sender_name: reply.map(|r| r.sender_name.clone()),
            image_url: None,
            attachments: Vec::new(),
        };
        if !groop.encryption_enabled {
            return message;
        }

        let keys = &self.ctx.keys;
        if !keys.has_group_key(&self.groop_id) {
            if let Err(e) = self
                .ctx
                .key_exchange
                .process_pending_key_exchanges(&self.user.id)
                .await
            {
                debug!(groop = %self.groop_id, error = %e, "key recovery before send failed");
            }
        }

        match keys.encrypt_message(text, &self.groop_id) {
            Some(ciphertext) => {
                message.text = ciphertext;
                message.reply_to_text = match message.reply_to_text.take() {
                    Some(reply_text) => keys.encrypt_message(&reply_text, &self.groop_id),
                    None => None,
                };
                message.is_encrypted = true;
            }
            None => {
                warn!(groop = %self.groop_id, "no group key, sending in plaintext");
            }
        }
        message
    }

    fn schedule_echo_removal(&self, temp_id: MessageId) {
        let shared = self.shared.clone();
        let generation = self.generation;
        let grace = self.ctx.config.optimistic_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            shared.update(generation, |state| {
                state.optimistic.retain(|m| m.id != temp_id);
                state.pending.retain(|p| p.id != temp_id);
            });
        });
    }

    async fn notify_members(
        &self,
        groop: &GroopRecord,
        message_id: &MessageId,
        text: &str,
        is_encrypted: bool,
    ) {
        let recipients: Vec<UserId> = groop
            .members
            .iter()
            .filter(|m| **m != self.user.id)
            .cloned()
            .collect();
        if recipients.is_empty() {
            return;
        }

        let users = join_all(recipients.iter().map(|id| self.ctx.store.get_user(id))).await;
        let tokens: Vec<String> = users
            .into_iter()
            .filter_map(|u| u.ok().flatten())
            .flat_map(|u| u.push_tokens)
            .collect();

        let preview = if is_encrypted {
            ENCRYPTED_NOTIFICATION_PREVIEW.to_string()
        } else {
            text.chars()
                .take(self.ctx.config.notification_preview_len)
                .collect()
        };

        let record = NotificationRecord {
            kind: "message".into(),
            groop_id: self.groop_id.clone(),
            message_id: message_id.clone(),
            sender_id: self.user.id.clone(),
            recipient_ids: recipients,
            preview,
            tokens,
        };
        if let Err(e) = self.ctx.store.add_notification(record).await {
            warn!(groop = %self.groop_id, error = %e, "failed to queue notification");
        }
    }

    /// Forget a failed send.
    pub fn dismiss_failed(&self, op_id: &MessageId) -> bool {
        self.update(|state| {
            let before = state.pending.len();
            state
                .pending
                .retain(|p| !(p.id == *op_id && p.status == PendingStatus::Failed));
            before != state.pending.len()
        })
        .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    /// Toggle the caller's `emoji` reaction. Applied locally first and
    /// reverted if the store rejects the write. Returns whether the reaction
    /// is now present.
    pub async fn toggle_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<bool> {
        self.ensure_open()?;
        let user_id = self.user.id.clone();

        let present = self
            .update(|state| {
                let message = state.synced_mut(message_id)?;
                let present = !message.has_reaction(emoji, &user_id);
                message.set_reaction(emoji, &user_id, present);
                Some(present)
            })
            .flatten()
            .ok_or_else(|| BackendError::NotFound(format!("messages/{message_id}")))?;

        if let Err(e) = self
            .ctx
            .store
            .set_reaction(&self.groop_id, message_id, emoji, &user_id, present)
            .await
        {
            warn!(groop = %self.groop_id, message = %message_id, error = %e, "reaction write failed, reverting");
            self.update(|state| {
                if let Some(message) = state.synced_mut(message_id) {
                    message.set_reaction(emoji, &user_id, !present);
                }
            });
            return Err(e.into());
        }
        Ok(present)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Fetch the next page of older messages. Returns how many were added;
    /// zero when there is nothing to do.
    pub async fn load_older_messages(&self) -> Result<usize> {
        self.ensure_open()?;
        let cursor = self
            .update(|state| {
                if state.loading_older || !state.has_more_history {
                    return None;
                }
                let cursor = state.oldest_cursor?;
                state.loading_older = true;
                Some(cursor)
            })
            .flatten();
        let Some(cursor) = cursor else {
            return Ok(0);
        };

        let result = self
            .ctx
            .sync
            .fetch_older_messages(&self.groop_id, cursor, self.ctx.config.history_page_size)
            .await;

        match result {
            Ok(page) => {
                let added = self
                    .update(|state| {
                        state.loading_older = false;
                        state.has_more_history = !page.exhausted;
                        state.merge_cursor(Some(page.next_cursor));
                        let mut added = 0;
                        for message in page.messages {
                            if state.live.iter().any(|m| m.id == message.id) {
                                continue;
                            }
                            if state.older.insert(message.id.clone(), message).is_none() {
                                added += 1;
                            }
                        }
                        added
                    })
                    .unwrap_or(0);
                debug!(groop = %self.groop_id, added, "loaded older messages");
                Ok(added)
            }
            Err(e) => {
                self.update(|state| {
                    state.loading_older = false;
                    state.error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Read state
    // ------------------------------------------------------------------

    /// Record everything currently loaded as read by the caller.
    pub async fn mark_read(&self) -> Result<()> {
        self.ensure_open()?;
        let user_id = self.user.id.clone();
        let (newest, unread) = {
            let state = self.shared.lock();
            let synced = state.synced();
            let Some(newest) = synced.last().map(|m| m.created_at) else {
                return Ok(());
            };
            let unread: Vec<MessageId> = synced
                .iter()
                .filter(|m| m.sender_id != user_id && !m.read.contains(&user_id))
                .map(|m| m.id.clone())
                .collect();
            (newest, unread)
        };

        self.ctx
            .store
            .set_last_read(&self.groop_id, &user_id, newest)
            .await?;
        if !unread.is_empty() {
            self.ctx
                .store
                .mark_read_by(&self.groop_id, &unread, &user_id)
                .await?;
        }

        self.update(|state| {
            state.last_read = Some(newest);
            state.first_unread_id = None;
            for id in &unread {
                if let Some(message) = state.synced_mut(id) {
                    message.read.insert(user_id.clone());
                }
            }
        });
        Ok(())
    }

    /// Recompute the first-unread marker from the stored watermark.
    pub async fn refresh_unread_marker(&self) -> Result<Option<MessageId>> {
        self.ensure_open()?;
        let groop = self
            .ctx
            .store
            .get_groop(&self.groop_id)
            .await?
            .ok_or_else(|| ChatError::GroupNotFound(self.groop_id.clone()))?;
        let last_read = groop.last_read.get(&self.user.id).copied();
        let user_id = self.user.id.clone();

        Ok(self
            .update(|state| {
                state.last_read = last_read;
                state.first_unread_id = compute_first_unread(&state.synced(), &user_id, last_read);
                state.first_unread_id.clone()
            })
            .flatten())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Stop syncing. Work still in flight for this session is discarded.
    pub fn close(&self) {
        let previous = self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut subscription) = subscription {
            subscription.unsubscribe();
        }
        if previous == self.generation {
            info!(groop = %self.groop_id, user = %self.user.id, "chat session closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.is_current(self.generation)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

async fn fetch_membership(ctx: &ChatContext, groop_id: &GroopId, user_id: &UserId) -> Result<GroopRecord> {
    let groop = ctx
        .store
        .get_groop(groop_id)
        .await?
        .ok_or_else(|| ChatError::GroupNotFound(groop_id.clone()))?;
    if !groop.is_member(user_id) {
        return Err(ChatError::NotAMember {
            groop_id: groop_id.clone(),
            user_id: user_id.clone(),
        });
    }
    Ok(groop)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::backend::RemoteStore;
    use crate::config::ChatConfig;
    use crate::key_manager::KeyManager;
    use crate::model::{GroopRecord, MessageDoc, UserRecord};

    struct Fixture {
        store: Arc<MemoryStore>,
        ctx: Arc<ChatContext>,
        groop: GroopId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut alice = UserRecord::new(UserId::from("alice"), "Alice");
        alice.push_tokens = vec!["tok-alice".into()];
        let mut bob = UserRecord::new(UserId::from("bob"), "Bob");
        bob.push_tokens = vec!["tok-bob".into()];
        store.put_user(alice);
        store.put_user(bob);

        let groop = GroopId::from("alps");
        store.create_groop(GroopRecord::new(
            groop.clone(),
            "Alps",
            vec![UserId::from("alice"), UserId::from("bob")],
        ));

        let config = ChatConfig {
            page_size: 5,
            history_page_size: 5,
            optimistic_grace: Duration::from_millis(100),
            ..ChatConfig::default()
        };
        let keys = Arc::new(KeyManager::in_memory().unwrap());
        let ctx = ChatContext::new(config, store.clone(), keys);
        Fixture { store, ctx, groop }
    }

    fn alice() -> SessionUser {
        SessionUser::new("alice", "Alice")
    }

    fn doc_from(id: &str, sender: &str, secs: i64) -> MessageDoc {
        NewMessage {
            text: format!("msg {id}"),
            is_encrypted: false,
            sender_id: UserId::from(sender),
            sender_name: sender.into(),
            sender_avatar: None,
            reply_to: None,
            reply_to_text: None,
            reply_to_sender_name: None,
            image_url: None,
            attachments: Vec::new(),
        }
        .into_doc(MessageId::from(id), Utc.timestamp_opt(secs, 0).unwrap())
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ChatView>,
        pred: impl Fn(&ChatView) -> bool,
    ) -> ChatView {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                {
                    let view = rx.borrow_and_update();
                    if pred(&view) {
                        return view.clone();
                    }
                }
                rx.changed().await.expect("session dropped");
            }
        })
        .await
        .expect("timed out waiting for view")
    }

    fn count_text(view: &ChatView, text: &str) -> usize {
        view.messages.iter().filter(|m| m.text == text).count()
    }

    #[tokio::test]
    async fn test_open_rejects_non_members() {
        let f = fixture();
        let err = ChatSession::open(f.ctx.clone(), f.groop.clone(), SessionUser::new("eve", "Eve"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::NotAMember { .. }));

        let err = ChatSession::open(f.ctx.clone(), GroopId::from("nowhere"), alice())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::GroupNotFound(_)));
    }

    #[tokio::test]
    async fn test_optimistic_send_reconciles() {
        let f = fixture();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        let mut rx = session.view();

        let remote_id = session.send_message("hi", None).await.unwrap();
        let view = session.snapshot();
        assert!(count_text(&view, "hi") >= 1);
        let op = &view.pending[0];
        assert!(op.id.is_optimistic());
        assert_eq!(op.status, PendingStatus::Sent);
        assert_eq!(op.remote_id.as_ref(), Some(&remote_id));

        let view = wait_for(&mut rx, |v| v.message(&remote_id).is_some()).await;
        assert_eq!(count_text(&view, "hi"), 1);

        let view = wait_for(&mut rx, |v| v.pending.is_empty()).await;
        assert_eq!(count_text(&view, "hi"), 1);
        assert!(view.messages.iter().all(|m| !m.id.is_optimistic()));
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back() {
        let f = fixture();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        f.store.set_fail_message_writes(true);

        let err = session.send_message("hi", None).await.unwrap_err();
        assert!(matches!(err, ChatError::SendFailed(_)));

        let view = session.snapshot();
        assert_eq!(count_text(&view, "hi"), 0);
        assert_eq!(view.pending.len(), 1);
        assert_eq!(view.pending[0].status, PendingStatus::Failed);
        assert!(view.pending[0].error.is_some());

        let op_id = view.pending[0].id.clone();
        assert!(session.dismiss_failed(&op_id));
        assert!(session.snapshot().pending.is_empty());
        assert!(f.store.notifications().is_empty());
    }

    #[tokio::test]
    async fn test_send_writes_notification() {
        let f = fixture();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        let id = session.send_message("Cable car leaves at 10", None).await.unwrap();

        let notifications = f.store.notifications();
        assert_eq!(notifications.len(), 1);
        let n = &notifications[0];
        assert_eq!(n.message_id, id);
        assert_eq!(n.recipient_ids, vec![UserId::from("bob")]);
        assert_eq!(n.tokens, vec!["tok-bob".to_string()]);
        assert_eq!(n.preview, "Cable car leaves at 10");
    }

    #[tokio::test]
    async fn test_encrypted_send_stores_ciphertext() {
        let f = fixture();
        f.ctx
            .key_exchange
            .setup_group_encryption(&f.groop, &UserId::from("alice"))
            .await
            .unwrap();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        let mut rx = session.view();

        let id = session.send_message("secret fondue spot", None).await.unwrap();

        let stored = f.store.messages(&f.groop);
        assert!(stored[0].is_encrypted);
        assert_ne!(stored[0].text, "secret fondue spot");
        assert_eq!(f.store.notifications()[0].preview, ENCRYPTED_NOTIFICATION_PREVIEW);

        let view = wait_for(&mut rx, |v| v.message(&id).is_some()).await;
        let message = view.message(&id).unwrap();
        assert_eq!(message.text, "secret fondue spot");
        assert_eq!(message.is_decrypted, Some(true));
    }

    #[tokio::test]
    async fn test_plaintext_fallback_echo_is_not_marked_encrypted() {
        let f = fixture();
        // Encryption is on but this device never received a key
        f.store.enable_encryption_if_disabled(&f.groop).await.unwrap();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();

        session.send_message("meet at the hut", None).await.unwrap();

        assert!(!f.store.messages(&f.groop)[0].is_encrypted);
        let view = session.snapshot();
        assert!(count_text(&view, "meet at the hut") >= 1);
        for message in view.messages.iter().filter(|m| m.text == "meet at the hut") {
            assert!(!message.is_encrypted);
            assert_eq!(message.is_decrypted, None);
        }
    }

    #[tokio::test]
    async fn test_reaction_toggle_and_rollback() {
        let f = fixture();
        f.store.insert_message_doc(&f.groop, doc_from("m1", "bob", 100)).unwrap();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        let id = MessageId::from("m1");
        let me = UserId::from("alice");

        assert!(session.toggle_reaction(&id, "👍").await.unwrap());
        assert!(session.snapshot().message(&id).unwrap().has_reaction("👍", &me));
        assert_eq!(
            f.store.messages(&f.groop)[0].reactions.get("👍"),
            Some(&vec![me.clone()])
        );

        f.store.set_fail_reaction_writes(true);
        assert!(session.toggle_reaction(&id, "👍").await.is_err());
        // Removal was reverted
        assert!(session.snapshot().message(&id).unwrap().has_reaction("👍", &me));

        assert!(session.toggle_reaction(&id, "🎉").await.is_err());
        assert!(!session.snapshot().message(&id).unwrap().has_reaction("🎉", &me));
    }

    #[tokio::test]
    async fn test_reaction_on_unknown_message() {
        let f = fixture();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        let err = session
            .toggle_reaction(&MessageId::from("missing"), "👍")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Backend(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_load_older_pages_until_exhausted() {
        let f = fixture();
        for i in 0..12 {
            f.store
                .insert_message_doc(&f.groop, doc_from(&format!("m{i:02}"), "bob", 100 + i))
                .unwrap();
        }
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();

        let view = session.snapshot();
        assert_eq!(view.messages.len(), 5);
        assert!(view.has_more_history);
        let mut cursor = view.oldest_cursor.unwrap();

        assert_eq!(session.load_older_messages().await.unwrap(), 5);
        let view = session.snapshot();
        assert!(view.oldest_cursor.unwrap() <= cursor);
        cursor = view.oldest_cursor.unwrap();
        assert!(view.has_more_history);

        assert_eq!(session.load_older_messages().await.unwrap(), 2);
        let view = session.snapshot();
        assert!(view.oldest_cursor.unwrap() <= cursor);
        assert!(!view.has_more_history);
        assert_eq!(view.messages.len(), 12);
        assert_eq!(view.messages[0].id, MessageId::from("m00"));

        // Exhausted: nothing more to do
        assert_eq!(session.load_older_messages().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unread_marker_and_mark_read() {
        let f = fixture();
        let watermark = Utc.timestamp_opt(200, 0).unwrap();
        f.store
            .set_last_read(&f.groop, &UserId::from("alice"), watermark)
            .await
            .unwrap();
        f.store.insert_message_doc(&f.groop, doc_from("A", "alice", 199)).unwrap();
        f.store.insert_message_doc(&f.groop, doc_from("B", "bob", 201)).unwrap();
        f.store.insert_message_doc(&f.groop, doc_from("C", "bob", 202)).unwrap();

        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        assert_eq!(session.snapshot().first_unread_id, Some(MessageId::from("B")));

        session.mark_read().await.unwrap();
        assert_eq!(session.snapshot().first_unread_id, None);
        let groop = f.store.groop(&f.groop).unwrap();
        assert_eq!(
            groop.last_read.get(&UserId::from("alice")),
            Some(&Utc.timestamp_opt(202, 0).unwrap())
        );
        assert!(f
            .store
            .messages(&f.groop)
            .iter()
            .filter(|d| d.sender_id.as_str() == "bob")
            .all(|d| d.read.contains(&UserId::from("alice"))));

        assert_eq!(session.refresh_unread_marker().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unread_marker_is_fixed_until_refreshed() {
        let f = fixture();
        let alice_id = UserId::from("alice");
        f.store
            .set_last_read(&f.groop, &alice_id, Utc.timestamp_opt(200, 0).unwrap())
            .await
            .unwrap();
        f.store.insert_message_doc(&f.groop, doc_from("A", "alice", 199)).unwrap();
        f.store.insert_message_doc(&f.groop, doc_from("B", "bob", 201)).unwrap();
        f.store.insert_message_doc(&f.groop, doc_from("C", "bob", 202)).unwrap();

        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        let mut rx = session.view();
        assert_eq!(session.snapshot().first_unread_id, Some(MessageId::from("B")));

        // New arrivals and a watermark moved elsewhere leave the marker alone
        f.store.insert_message_doc(&f.groop, doc_from("D", "bob", 300)).unwrap();
        f.store
            .set_last_read(&f.groop, &alice_id, Utc.timestamp_opt(202, 0).unwrap())
            .await
            .unwrap();
        let view = wait_for(&mut rx, |v| v.message(&MessageId::from("D")).is_some()).await;
        assert_eq!(view.first_unread_id, Some(MessageId::from("B")));

        assert_eq!(
            session.refresh_unread_marker().await.unwrap(),
            Some(MessageId::from("D"))
        );
        assert_eq!(session.snapshot().first_unread_id, Some(MessageId::from("D")));
    }

    #[tokio::test]
    async fn test_close_discards_late_updates() {
        let f = fixture();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        let before = session.snapshot();

        session.close();
        assert!(session.is_closed());
        f.store.insert_message_doc(&f.groop, doc_from("late", "bob", 500)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(session.snapshot().messages.len(), before.messages.len());
        assert_eq!(f.store.subscriber_count(&f.groop), 0);
        assert!(session.send_message("too late", None).await.is_err());
    }

    #[tokio::test]
    async fn test_subscription_error_surfaces_in_view() {
        let f = fixture();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();
        let mut rx = session.view();

        f.store
            .break_subscriptions(&f.groop, BackendError::Transport("connection reset".into()));
        let view = wait_for(&mut rx, |v| v.error.is_some()).await;
        assert!(view.error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_items_include_date_separators() {
        let f = fixture();
        f.store.insert_message_doc(&f.groop, doc_from("d1", "bob", 86_400)).unwrap();
        f.store
            .insert_message_doc(&f.groop, doc_from("d2", "bob", 2 * 86_400 + 60))
            .unwrap();
        let session = ChatSession::open(f.ctx.clone(), f.groop.clone(), alice()).await.unwrap();

        let items = session.snapshot().items;
        let separators = items
            .iter()
            .filter(|i| matches!(i, ChatItem::DateSeparator { .. }))
            .count();
        assert_eq!(separators, 2);
        assert_eq!(items.len(), 4);
    }
}
