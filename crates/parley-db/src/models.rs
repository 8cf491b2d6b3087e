//! Database row types. These map directly to SQLite rows and are kept
//! separate from the parley-types domain models so the DB layer owns its
//! encoding (TEXT uuids, fixed-width TEXT timestamps).

use rusqlite::Row;
use tracing::warn;
use uuid::Uuid;

use parley_types::models::{Message, Presence, TypingIndicator, User};
use parley_types::{ChatError, ChatResult};

use crate::clock::parse_ts;

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub password: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub user_id: String,
    pub receiver_id: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
    pub read_at: Option<String>,
}

pub struct PresenceRow {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen: String,
}

pub struct TypingRow {
    pub user_id: String,
    pub conversation_partner_id: String,
    pub is_typing: bool,
}

pub(crate) const MESSAGE_COLUMNS: &str =
    "id, user_id, receiver_id, content, status, created_at, read_at";

impl MessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            receiver_id: row.get(2)?,
            content: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            read_at: row.get(6)?,
        })
    }

    pub fn into_message(self) -> ChatResult<Message> {
        Ok(Message {
            id: self.id,
            sender_id: parse_uuid(&self.user_id, "user_id")?,
            receiver_id: parse_uuid(&self.receiver_id, "receiver_id")?,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
            read_at: self.read_at.as_deref().map(parse_ts).transpose()?,
            content: self.content,
        })
    }
}

impl UserRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            display_name: row.get(2)?,
            password: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    pub fn to_user(&self) -> ChatResult<User> {
        Ok(User {
            id: parse_uuid(&self.id, "users.id")?,
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl PresenceRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            is_online: row.get(1)?,
            last_seen: row.get(2)?,
        })
    }

    pub fn into_presence(self) -> ChatResult<Presence> {
        Ok(Presence {
            user_id: parse_uuid(&self.user_id, "user_presence.user_id")?,
            is_online: self.is_online,
            last_seen: parse_ts(&self.last_seen)?,
        })
    }
}

impl TypingRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            conversation_partner_id: row.get(1)?,
            is_typing: row.get(2)?,
        })
    }

    pub fn into_indicator(self) -> ChatResult<TypingIndicator> {
        Ok(TypingIndicator {
            user_id: parse_uuid(&self.user_id, "typing_indicators.user_id")?,
            conversation_partner_id: parse_uuid(
                &self.conversation_partner_id,
                "typing_indicators.conversation_partner_id",
            )?,
            is_typing: self.is_typing,
        })
    }
}

fn parse_uuid(raw: &str, column: &str) -> ChatResult<Uuid> {
    raw.parse().map_err(|e| {
        warn!("Corrupt {} '{}': {}", column, raw, e);
        ChatError::Internal(format!("corrupt {} '{}'", column, raw))
    })
}
