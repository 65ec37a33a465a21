//! Group key distribution over the shared backing store.
//!
//! A member holding a group key wraps it for a peer's published X25519 public
//! key and appends a `pending` record to `groops/{id}/keyExchanges`. The
//! recipient's device later opens every record addressed to it and moves each
//! one to `completed` or `failed`.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use groop_shared::keypair::decode_public_key;
use groop_shared::{GroopId, UserId, UserKeyPair};

use crate::backend::RemoteStore;
use crate::error::{BackendError, ChatError, Result};
use crate::key_manager::KeyManager;
use crate::model::{KeyExchangeRecord, KeyExchangeStatus};

/// Outcome of scanning the key exchange inbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyExchangeReport {
    /// Groups for which a key was received and stored.
    pub completed: Vec<GroopId>,
    /// Records that could not be opened.
    pub failed: Vec<String>,
}

impl KeyExchangeReport {
    pub fn received_key_for(&self, groop_id: &GroopId) -> bool {
        self.completed.contains(groop_id)
    }
}

/// A share that did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareFailure {
    pub member: UserId,
    pub reason: String,
}

/// Outcome of sharing the active key with every other member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub version: u32,
    pub shared: Vec<UserId>,
    pub failed: Vec<ShareFailure>,
}

impl RotationReport {
    /// True only if every member received the key. A `false` result is a
    /// partial state: members in `shared` already hold the new version.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_members(&self) -> Vec<UserId> {
        self.failed.iter().map(|f| f.member.clone()).collect()
    }
}

pub struct KeyExchangeCoordinator {
    store: Arc<dyn RemoteStore>,
    keys: Arc<KeyManager>,
}

impl KeyExchangeCoordinator {
    pub fn new(store: Arc<dyn RemoteStore>, keys: Arc<KeyManager>) -> Self {
        Self { store, keys }
    }

    /// Make sure this device holds a keypair for `user_id` and that its public
    /// half is on the user's directory record.
    pub async fn ensure_user_keypair(&self, user_id: &UserId) -> Result<UserKeyPair> {
        let keypair = self.keys.get_or_create_user_keypair(user_id)?;
        let published = keypair.public_key_base64();

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("users/{user_id}")))?;

        if user.public_key.as_deref() != Some(published.as_str()) || user.needs_key_generation {
            self.store.publish_public_key(user_id, &published).await?;
            info!(user = %user_id, "published public key");
        }
        Ok(keypair)
    }

    /// Turn on encryption for a group. Returns `Ok(true)` when this call
    /// enabled it and generated the first key, `Ok(false)` when another
    /// member got there first.
    pub async fn setup_group_encryption(
        &self,
        groop_id: &GroopId,
        creator_id: &UserId,
    ) -> Result<bool> {
        if !self.keys.check_secure_random_available() {
            return Err(ChatError::CryptoUnavailable);
        }

        let groop = self
            .store
            .get_groop(groop_id)
            .await?
            .ok_or_else(|| ChatError::GroupNotFound(groop_id.clone()))?;
        if !groop.is_member(creator_id) {
            return Err(ChatError::NotAMember {
                groop_id: groop_id.clone(),
                user_id: creator_id.clone(),
            });
        }

        self.ensure_user_keypair(creator_id).await?;

        if !self.store.enable_encryption_if_disabled(groop_id).await? {
            debug!(groop = %groop_id, "encryption already enabled");
            return Ok(false);
        }

        let key = self.keys.generate_group_key_after(groop_id, groop.key_version)?;
        self.store
            .record_key_rotation(groop_id, key.version, key.created_at)
            .await?;

        info!(groop = %groop_id, creator = %creator_id, "group encryption enabled");
        Ok(true)
    }

    /// Wrap the local group key for one recipient and post it to their inbox.
    pub async fn share_group_key_with_member(
        &self,
        groop_id: &GroopId,
        recipient_id: &UserId,
        sender_id: &UserId,
    ) -> Result<KeyExchangeRecord> {
        if !self.keys.has_group_key(groop_id) {
            return Err(ChatError::KeyMissing(groop_id.clone()));
        }

        let sender = self
            .keys
            .user_keypair(sender_id)
            .ok_or_else(|| ChatError::LocalIdentityMissing(sender_id.clone()))?;

        let recipient_key = match self.published_key(recipient_id).await? {
            Some(key) => key,
            None => {
                self.store.flag_needs_key_generation(recipient_id).await?;
                warn!(groop = %groop_id, recipient = %recipient_id, "recipient has no public key, flagged");
                return Err(ChatError::PeerKeyMissing(recipient_id.clone()));
            }
        };

        let encrypted_key = self
            .keys
            .wrap_group_key_for_recipient(groop_id, &recipient_key, &sender.secret_key)
            .ok_or_else(|| ChatError::KeyWrapFailed(recipient_id.clone()))?;

        let record = KeyExchangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            groop_id: groop_id.clone(),
            sender_id: sender_id.clone(),
            recipient_id: recipient_id.clone(),
            encrypted_key,
            status: KeyExchangeStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
        };
        self.store.add_key_exchange(&record).await?;

        debug!(groop = %groop_id, sender = %sender_id, recipient = %recipient_id, "group key shared");
        Ok(record)
    }

    /// Share the active key with every member except `sender_id`.
    pub async fn distribute_group_key(
        &self,
        groop_id: &GroopId,
        sender_id: &UserId,
    ) -> Result<RotationReport> {
        let version = self
            .keys
            .active_group_key(groop_id)
            .map(|k| k.version)
            .ok_or_else(|| ChatError::KeyMissing(groop_id.clone()))?;

        let groop = self
            .store
            .get_groop(groop_id)
            .await?
            .ok_or_else(|| ChatError::GroupNotFound(groop_id.clone()))?;

        let recipients: Vec<UserId> = groop
            .members
            .into_iter()
            .filter(|m| m != sender_id)
            .collect();

        let results = join_all(
            recipients
                .iter()
                .map(|member| self.share_group_key_with_member(groop_id, member, sender_id)),
        )
        .await;

        let mut report = RotationReport {
            version,
            shared: Vec::new(),
            failed: Vec::new(),
        };
        for (member, result) in recipients.into_iter().zip(results) {
            match result {
                Ok(_) => report.shared.push(member),
                Err(e) => report.failed.push(ShareFailure {
                    member,
                    reason: e.to_string(),
                }),
            }
        }

        if !report.is_complete() {
            warn!(
                groop = %groop_id,
                version,
                failed = report.failed.len(),
                "group key did not reach every member"
            );
        }
        Ok(report)
    }

    /// Open every pending record addressed to `user_id`, across all of the
    /// user's groups.
    pub async fn process_pending_key_exchanges(&self, user_id: &UserId) -> Result<KeyExchangeReport> {
        let keypair = self.ensure_user_keypair(user_id).await?;
        let mut report = KeyExchangeReport::default();

        for groop_id in self.store.groops_for_member(user_id).await? {
            let pending = self.store.pending_key_exchanges(&groop_id, user_id).await?;
            for record in pending {
                let opened = self.receive(&record, &keypair).await;
                let status = if opened {
                    KeyExchangeStatus::Completed
                } else {
                    KeyExchangeStatus::Failed
                };

                if let Err(e) = self
                    .store
                    .complete_key_exchange(&groop_id, &record.id, status, Utc::now())
                    .await
                {
                    // Another device for the same user may have taken it
                    warn!(groop = %groop_id, record = %record.id, error = %e, "failed to update key exchange");
                    continue;
                }

                if opened {
                    if !report.completed.contains(&groop_id) {
                        report.completed.push(groop_id.clone());
                    }
                } else {
                    report.failed.push(record.id.clone());
                }
            }
        }

        if !report.completed.is_empty() || !report.failed.is_empty() {
            info!(
                user = %user_id,
                completed = report.completed.len(),
                failed = report.failed.len(),
                "processed key exchanges"
            );
        }
        Ok(report)
    }

    async fn receive(&self, record: &KeyExchangeRecord, keypair: &UserKeyPair) -> bool {
        let sender_key = match self.published_key(&record.sender_id).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!(record = %record.id, sender = %record.sender_id, "sender has no public key");
                return false;
            }
            Err(e) => {
                warn!(record = %record.id, error = %e, "failed to look up sender");
                return false;
            }
        };

        self.keys.unwrap_group_key_from_sender(
            &record.encrypted_key,
            &sender_key,
            &keypair.secret_key,
            &record.groop_id,
        )
    }

    /// Ask existing members, in order, to share the key with a newcomer.
    /// Returns the member that succeeded.
    pub async fn handle_new_member_joined(
        &self,
        groop_id: &GroopId,
        new_member_id: &UserId,
        existing_member_ids: &[UserId],
    ) -> Option<UserId> {
        for member in existing_member_ids.iter().filter(|m| *m != new_member_id) {
            match self
                .share_group_key_with_member(groop_id, new_member_id, member)
                .await
            {
                Ok(_) => {
                    info!(groop = %groop_id, new_member = %new_member_id, via = %member, "key shared with new member");
                    return Some(member.clone());
                }
                Err(e) => {
                    debug!(groop = %groop_id, via = %member, error = %e, "member could not share key");
                }
            }
        }

        warn!(groop = %groop_id, new_member = %new_member_id, "no member could share the group key");
        None
    }

    /// Generate a new key version and share it with every other member.
    /// Partial failure is reported, not rolled back.
    pub async fn rotate_group_key(
        &self,
        groop_id: &GroopId,
        initiator_id: &UserId,
    ) -> Result<RotationReport> {
        if !self.keys.check_secure_random_available() {
            return Err(ChatError::CryptoUnavailable);
        }

        self.ensure_user_keypair(initiator_id).await?;

        // Versions rotated by other members may not have reached this device
        let groop = self
            .store
            .get_groop(groop_id)
            .await?
            .ok_or_else(|| ChatError::GroupNotFound(groop_id.clone()))?;
        let key = self.keys.generate_group_key_after(groop_id, groop.key_version)?;
        self.store
            .record_key_rotation(groop_id, key.version, key.created_at)
            .await?;
        info!(groop = %groop_id, version = key.version, initiator = %initiator_id, "rotated group key");

        self.distribute_group_key(groop_id, initiator_id).await
    }

    async fn published_key(&self, user_id: &UserId) -> Result<Option<[u8; 32]>> {
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(None);
        };
        let Some(encoded) = user.public_key else {
            return Ok(None);
        };
        match decode_public_key(&encoded) {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                warn!(user = %user_id, error = %e, "published public key is malformed");
                Ok(None)
            }
        }
    }
}
