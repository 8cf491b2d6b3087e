use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                email         TEXT NOT NULL UNIQUE,
                display_name  TEXT NOT NULL,
                password      TEXT NOT NULL,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE messages (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id       TEXT NOT NULL REFERENCES users(id),
                receiver_id   TEXT NOT NULL REFERENCES users(id),
                content       TEXT NOT NULL CHECK (length(trim(content)) > 0),
                status        TEXT NOT NULL DEFAULT 'sent'
                              CHECK (status IN ('sent', 'delivered', 'read')),
                created_at    TEXT NOT NULL,
                read_at       TEXT,
                CHECK (user_id <> receiver_id)
            );

            CREATE INDEX idx_messages_pair
                ON messages(user_id, receiver_id, created_at, id);

            CREATE INDEX idx_messages_unread
                ON messages(receiver_id, status);

            CREATE TABLE typing_indicators (
                user_id                  TEXT NOT NULL REFERENCES users(id),
                conversation_partner_id  TEXT NOT NULL REFERENCES users(id),
                is_typing                INTEGER NOT NULL,
                updated_at               TEXT NOT NULL,
                UNIQUE(user_id, conversation_partner_id)
            );

            CREATE TABLE user_presence (
                user_id    TEXT NOT NULL UNIQUE REFERENCES users(id),
                is_online  INTEGER NOT NULL,
                last_seen  TEXT NOT NULL
            );

            CREATE INDEX idx_presence_online
                ON user_presence(is_online, last_seen);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
