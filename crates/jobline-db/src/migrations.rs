use rusqlite::Connection;
use tracing::info;

use crate::StoreError;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        -- Timestamps are app-supplied RFC3339 with microseconds so that
        -- lexicographic comparison matches chronological order.
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            pair_key        TEXT NOT NULL UNIQUE,
            title           TEXT,
            last_message    TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        -- Per-participant view state. archived/hidden never affect the
        -- other members; last_read_at drives per-user unread counts.
        CREATE TABLE IF NOT EXISTS conversation_members (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id         TEXT NOT NULL,
            archived        INTEGER NOT NULL DEFAULT 0,
            hidden          INTEGER NOT NULL DEFAULT 0,
            last_read_at    TEXT,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_members_user
            ON conversation_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            author_id       TEXT NOT NULL,
            recipient_id    TEXT,
            body            TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at, id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
