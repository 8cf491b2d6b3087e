//! Plain SQL over a borrowed connection. Callers own locking and event emission.

use rusqlite::Connection;
use rusqlite::types::ToSql;

use parley_types::ChatResult;

use crate::SqlResultExt;
use crate::models::{MESSAGE_COLUMNS, MessageRow, PresenceRow, TypingRow, UserRow};

// -- Users --

pub fn insert_user(
    conn: &Connection,
    id: &str,
    email: &str,
    display_name: &str,
    password_hash: &str,
    created_at: &str,
) -> ChatResult<()> {
    conn.execute(
        "INSERT INTO users (id, email, display_name, password, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        (id, email, display_name, password_hash, created_at),
    )
    .db()?;
    Ok(())
}

pub fn user_by_email(conn: &Connection, email: &str) -> ChatResult<Option<UserRow>> {
    conn.query_row(
        "SELECT id, email, display_name, password, created_at FROM users WHERE email = ?1",
        [email],
        UserRow::from_row,
    )
    .optional()
}

pub fn user_by_id(conn: &Connection, id: &str) -> ChatResult<Option<UserRow>> {
    conn.query_row(
        "SELECT id, email, display_name, password, created_at FROM users WHERE id = ?1",
        [id],
        UserRow::from_row,
    )
    .optional()
}

pub fn user_exists(conn: &Connection, id: &str) -> ChatResult<bool> {
    conn.query_row("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)", [id], |row| row.get(0))
        .db()
}

pub fn users_by_ids(conn: &Connection, ids: &[String]) -> ChatResult<Vec<UserRow>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let sql = format!(
        "SELECT id, email, display_name, password, created_at FROM users WHERE id IN ({})",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql).db()?;
    let rows = stmt
        .query_map(as_params(ids).as_slice(), UserRow::from_row)
        .db()?
        .collect::<Result<Vec<_>, _>>()
        .db()?;
    Ok(rows)
}

// -- Messages --

/// Insert and return the new row id.
pub fn insert_message(
    conn: &Connection,
    sender_id: &str,
    receiver_id: &str,
    content: &str,
    created_at: &str,
) -> ChatResult<i64> {
    conn.execute(
        "INSERT INTO messages (user_id, receiver_id, content, status, created_at) VALUES (?1, ?2, ?3, 'sent', ?4)",
        (sender_id, receiver_id, content, created_at),
    )
    .db()?;
    Ok(conn.last_insert_rowid())
}

pub fn message_by_id(conn: &Connection, id: i64) -> ChatResult<Option<MessageRow>> {
    conn.query_row(
        &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
        [id],
        MessageRow::from_row,
    )
    .optional()
}

/// Both directions between `a` and `b`, ascending by (created_at, id).
pub fn conversation_messages(
    conn: &Connection,
    a: &str,
    b: &str,
    after_id: Option<i64>,
) -> ChatResult<Vec<MessageRow>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM messages
             WHERE ((user_id = ?1 AND receiver_id = ?2) OR (user_id = ?2 AND receiver_id = ?1))
               AND id > ?3
             ORDER BY created_at ASC, id ASC",
            MESSAGE_COLUMNS
        ))
        .db()?;

    let rows = stmt
        .query_map(rusqlite::params![a, b, after_id.unwrap_or(0)], MessageRow::from_row)
        .db()?
        .collect::<Result<Vec<_>, _>>()
        .db()?;
    Ok(rows)
}

/// Every message a user sent or received, ascending by (created_at, id).
pub fn messages_for_user(conn: &Connection, user_id: &str) -> ChatResult<Vec<MessageRow>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM messages
             WHERE user_id = ?1 OR receiver_id = ?1
             ORDER BY created_at ASC, id ASC",
            MESSAGE_COLUMNS
        ))
        .db()?;

    let rows = stmt
        .query_map([user_id], MessageRow::from_row)
        .db()?
        .collect::<Result<Vec<_>, _>>()
        .db()?;
    Ok(rows)
}

pub fn set_message_status(
    conn: &Connection,
    id: i64,
    status: &str,
    read_at: Option<&str>,
) -> ChatResult<()> {
    conn.execute(
        "UPDATE messages SET status = ?2, read_at = COALESCE(?3, read_at) WHERE id = ?1",
        rusqlite::params![id, status, read_at],
    )
    .db()?;
    Ok(())
}

/// Ids of messages from `sender` to `reader` that are not read yet, oldest first.
pub fn unread_ids_from(conn: &Connection, reader: &str, sender: &str) -> ChatResult<Vec<i64>> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM messages
             WHERE receiver_id = ?1 AND user_id = ?2 AND status != 'read'
             ORDER BY created_at ASC, id ASC",
        )
        .db()?;
    let ids = stmt
        .query_map([reader, sender], |row| row.get(0))
        .db()?
        .collect::<Result<Vec<_>, _>>()
        .db()?;
    Ok(ids)
}

// -- Presence --

pub fn upsert_presence(conn: &Connection, user_id: &str, is_online: bool, last_seen: &str) -> ChatResult<()> {
    conn.execute(
        "INSERT INTO user_presence (user_id, is_online, last_seen) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET is_online = excluded.is_online, last_seen = excluded.last_seen",
        rusqlite::params![user_id, is_online, last_seen],
    )
    .db()?;
    Ok(())
}

/// Refresh last_seen of an online user. Returns the number of rows touched.
pub fn touch_presence(conn: &Connection, user_id: &str, last_seen: &str) -> ChatResult<usize> {
    conn.execute(
        "UPDATE user_presence SET last_seen = ?2 WHERE user_id = ?1 AND is_online = 1",
        [user_id, last_seen],
    )
    .db()
}

/// Flip a user offline without touching last_seen.
pub fn set_presence_offline(conn: &Connection, user_id: &str) -> ChatResult<usize> {
    conn.execute(
        "UPDATE user_presence SET is_online = 0 WHERE user_id = ?1 AND is_online = 1",
        [user_id],
    )
    .db()
}

pub fn presence_by_user(conn: &Connection, user_id: &str) -> ChatResult<Option<PresenceRow>> {
    conn.query_row(
        "SELECT user_id, is_online, last_seen FROM user_presence WHERE user_id = ?1",
        [user_id],
        PresenceRow::from_row,
    )
    .optional()
}

pub fn presence_for_users(conn: &Connection, user_ids: &[String]) -> ChatResult<Vec<PresenceRow>> {
    if user_ids.is_empty() {
        return Ok(vec![]);
    }
    let sql = format!(
        "SELECT user_id, is_online, last_seen FROM user_presence WHERE user_id IN ({})",
        placeholders(user_ids.len())
    );
    let mut stmt = conn.prepare(&sql).db()?;
    let rows = stmt
        .query_map(as_params(user_ids).as_slice(), PresenceRow::from_row)
        .db()?
        .collect::<Result<Vec<_>, _>>()
        .db()?;
    Ok(rows)
}

/// Online users whose last heartbeat is strictly older than `cutoff`.
pub fn stale_online_users(conn: &Connection, cutoff: &str) -> ChatResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT user_id FROM user_presence WHERE is_online = 1 AND last_seen < ?1")
        .db()?;
    let ids = stmt
        .query_map([cutoff], |row| row.get(0))
        .db()?
        .collect::<Result<Vec<_>, _>>()
        .db()?;
    Ok(ids)
}

// -- Typing --

pub fn upsert_typing(
    conn: &Connection,
    user_id: &str,
    partner_id: &str,
    is_typing: bool,
    updated_at: &str,
) -> ChatResult<()> {
    conn.execute(
        "INSERT INTO typing_indicators (user_id, conversation_partner_id, is_typing, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, conversation_partner_id)
         DO UPDATE SET is_typing = excluded.is_typing, updated_at = excluded.updated_at",
        rusqlite::params![user_id, partner_id, is_typing, updated_at],
    )
    .db()?;
    Ok(())
}

pub fn typing_row(conn: &Connection, user_id: &str, partner_id: &str) -> ChatResult<Option<TypingRow>> {
    conn.query_row(
        "SELECT user_id, conversation_partner_id, is_typing FROM typing_indicators
         WHERE user_id = ?1 AND conversation_partner_id = ?2",
        [user_id, partner_id],
        TypingRow::from_row,
    )
    .optional()
}

/// Partners `user_id` is currently marked as typing to.
pub fn active_typing_partners(conn: &Connection, user_id: &str) -> ChatResult<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT conversation_partner_id FROM typing_indicators
             WHERE user_id = ?1 AND is_typing = 1",
        )
        .db()?;
    let ids = stmt
        .query_map([user_id], |row| row.get(0))
        .db()?
        .collect::<Result<Vec<_>, _>>()
        .db()?;
    Ok(ids)
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

fn as_params(values: &[String]) -> Vec<&dyn ToSql> {
    values.iter().map(|v| v as &dyn ToSql).collect()
}
