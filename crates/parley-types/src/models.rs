use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

pub type UserId = Uuid;

/// Server-assigned, strictly increasing per insert.
pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(ChatError::Internal(format!("unknown message status '{}'", other))),
        }
    }
}

/// A directed message. Only `status` and `read_at` change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// True if the message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// The other party from `user`'s point of view.
    pub fn partner_of(&self, user: UserId) -> Option<UserId> {
        if self.sender_id == user {
            Some(self.receiver_id)
        } else if self.receiver_id == user {
            Some(self.sender_id)
        } else {
            None
        }
    }

    pub fn is_unread_for(&self, user: UserId) -> bool {
        self.receiver_id == user && self.sender_id != user && self.status != MessageStatus::Read
    }

    /// Total order key within a conversation.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Ephemeral "user is typing to partner" state; one row per ordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub user_id: UserId,
    pub conversation_partner_id: UserId,
    pub is_typing: bool,
}

/// Derived per-partner summary. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub partner_id: UserId,
    pub partner_display_name: String,
    pub partner_email: String,
    pub last_message: Option<String>,
    pub last_message_id: Option<MessageId>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: usize,
    pub is_online: bool,
}

impl Conversation {
    /// A conversation with no history yet.
    pub fn empty(partner: &User, is_online: bool) -> Self {
        Self {
            partner_id: partner.id,
            partner_display_name: partner.display_name.clone(),
            partner_email: partner.email.clone(),
            last_message: None,
            last_message_id: None,
            last_message_time: None,
            unread_count: 0,
            is_online,
        }
    }
}

/// Trim message content, rejecting anything that is empty afterwards.
pub fn normalize_content(content: &str) -> ChatResult<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("message content is empty".into()));
    }
    Ok(trimmed.to_string())
}

/// Canonical form of an email used for identity lookups.
pub fn normalize_email(email: &str) -> ChatResult<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(ChatError::Validation(format!("'{}' is not an email address", email))),
    }
}
