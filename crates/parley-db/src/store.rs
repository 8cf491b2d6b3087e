use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, info};

use parley_types::events::{ChangeEvent, ChangeSink};
use parley_types::models::{Message, MessageId, MessageStatus, UserId, normalize_content};
use parley_types::{ChatError, ChatResult};

use crate::Database;
use crate::clock::format_ts;
use crate::queries;

/// Durable append-only log of direct messages.
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
    sink: Arc<dyn ChangeSink>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>, sink: Arc<dyn ChangeSink>) -> Self {
        Self { db, sink }
    }

    /// Persist a new message with status `sent`. Id and `created_at` are
    /// assigned here and are authoritative.
    pub fn send(&self, sender: UserId, receiver: UserId, content: &str) -> ChatResult<Message> {
        if sender == receiver {
            return Err(ChatError::Validation("cannot send a message to yourself".into()));
        }
        let content = normalize_content(content)?;

        let message = self.db.with_write(|conn, now| {
            if !queries::user_exists(conn, &receiver.to_string())? {
                return Err(ChatError::NotFound(format!("user {}", receiver)));
            }
            let id = queries::insert_message(
                conn,
                &sender.to_string(),
                &receiver.to_string(),
                &content,
                &format_ts(now),
            )?;
            let message = Message {
                id,
                sender_id: sender,
                receiver_id: receiver,
                content,
                status: MessageStatus::Sent,
                created_at: now,
                read_at: None,
            };
            self.sink.publish(ChangeEvent::MessageInserted {
                message: message.clone(),
            });
            Ok(message)
        })?;

        debug!("Message {} stored ({} -> {})", message.id, sender, receiver);
        Ok(message)
    }

    /// Full history between two users, ascending by (created_at, id).
    pub fn list_conversation(&self, a: UserId, b: UserId) -> ChatResult<Vec<Message>> {
        self.list_conversation_after(a, b, None)
    }

    /// History after a message id cursor; `None` returns everything.
    pub fn list_conversation_after(
        &self,
        a: UserId,
        b: UserId,
        after_id: Option<MessageId>,
    ) -> ChatResult<Vec<Message>> {
        let rows = self.db.with_conn(|conn| {
            queries::conversation_messages(conn, &a.to_string(), &b.to_string(), after_id)
        })?;
        rows.into_iter().map(|row| row.into_message()).collect()
    }

    pub fn get(&self, id: MessageId) -> ChatResult<Message> {
        self.db.with_conn(|conn| load(conn, id))
    }

    /// Receiver acknowledges a message. Re-marking returns the current state.
    pub fn mark_read(&self, id: MessageId, reader: UserId) -> ChatResult<Message> {
        self.db.with_write(|conn, now| {
            let message = load(conn, id)?;
            if message.receiver_id != reader {
                return Err(ChatError::Forbidden(format!(
                    "message {} is not addressed to {}",
                    id, reader
                )));
            }
            if message.status == MessageStatus::Read {
                return Ok(message);
            }
            self.transition(conn, message, MessageStatus::Read, now)
        })
    }

    /// Receiver's client got the message. Only moves `sent` forward.
    pub fn mark_delivered(&self, id: MessageId, reader: UserId) -> ChatResult<Message> {
        self.db.with_write(|conn, now| {
            let message = load(conn, id)?;
            if message.receiver_id != reader {
                return Err(ChatError::Forbidden(format!(
                    "message {} is not addressed to {}",
                    id, reader
                )));
            }
            if message.status != MessageStatus::Sent {
                return Ok(message);
            }
            self.transition(conn, message, MessageStatus::Delivered, now)
        })
    }

    /// Mark everything `partner` sent to `reader` as read. Returns the messages
    /// that actually changed, oldest first.
    pub fn mark_conversation_read(&self, reader: UserId, partner: UserId) -> ChatResult<Vec<Message>> {
        let changed = self.db.with_write(|conn, now| {
            let ids = queries::unread_ids_from(conn, &reader.to_string(), &partner.to_string())?;
            let mut changed = Vec::with_capacity(ids.len());
            for id in ids {
                let message = load(conn, id)?;
                changed.push(self.transition(conn, message, MessageStatus::Read, now)?);
            }
            Ok(changed)
        })?;

        if !changed.is_empty() {
            info!("{} read {} messages from {}", reader, changed.len(), partner);
        }
        Ok(changed)
    }

    fn transition(
        &self,
        conn: &Connection,
        mut message: Message,
        status: MessageStatus,
        now: chrono::DateTime<chrono::Utc>,
    ) -> ChatResult<Message> {
        let read_at = (status == MessageStatus::Read).then(|| format_ts(now));
        queries::set_message_status(conn, message.id, status.as_str(), read_at.as_deref())?;

        message.status = status;
        if status == MessageStatus::Read {
            message.read_at = Some(now);
        }
        self.sink.publish(ChangeEvent::MessageUpdated {
            message: message.clone(),
        });
        Ok(message)
    }
}

fn load(conn: &Connection, id: MessageId) -> ChatResult<Message> {
    queries::message_by_id(conn, id)?
        .ok_or_else(|| ChatError::NotFound(format!("message {}", id)))?
        .into_message()
}
