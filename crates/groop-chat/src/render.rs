//! Derived, never-persisted presentation data: the flat list of chat items
//! with date separators, and the first-unread marker.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;

use groop_shared::{MessageId, UserId};

use crate::model::Message;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatItem {
    Message(Message),
    DateSeparator { id: String, date: NaiveDate },
}

impl ChatItem {
    pub fn id(&self) -> String {
        match self {
            ChatItem::Message(m) => m.id.to_string(),
            ChatItem::DateSeparator { id, .. } => id.clone(),
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            ChatItem::Message(m) => Some(m),
            ChatItem::DateSeparator { .. } => None,
        }
    }
}

/// Interleave a separator before the first message of every calendar day.
/// `messages` must already be ascending.
pub fn build_chat_items(messages: &[Message], offset: FixedOffset) -> Vec<ChatItem> {
    let mut items = Vec::with_capacity(messages.len() + 4);
    let mut current_day: Option<NaiveDate> = None;

    for message in messages {
        let day = message.created_at.with_timezone(&offset).date_naive();
        if current_day != Some(day) {
            items.push(ChatItem::DateSeparator {
                id: format!("date-{}", day.format("%Y-%m-%d")),
                date: day,
            });
            current_day = Some(day);
        }
        items.push(ChatItem::Message(message.clone()));
    }
    items
}

/// Earliest message from someone else that the user has not read yet.
///
/// With a watermark, that is the first such message strictly newer than it.
/// Without one, the first such message whose read set lacks the user.
pub fn compute_first_unread(
    messages: &[Message],
    user_id: &UserId,
    last_read: Option<DateTime<Utc>>,
) -> Option<MessageId> {
    messages
        .iter()
        .filter(|m| &m.sender_id != user_id)
        .find(|m| match last_read {
            Some(watermark) => m.created_at > watermark,
            None => !m.read.contains(user_id),
        })
        .map(|m| m.id.clone())
}
