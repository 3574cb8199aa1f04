use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Timestamps are stored as INTEGER microseconds since the Unix epoch and ids as
/// lowercase hyphenated UUID text, so `ORDER BY` and the canonical-pair CHECK both
/// agree with the in-memory order of `DateTime<Utc>` and `Uuid`.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (conversations, messages, profiles)");
        conn.execute_batch(
            "
            CREATE TABLE profiles (
                user_id         TEXT PRIMARY KEY,
                display_name    TEXT NOT NULL,
                avatar_url      TEXT
            );

            CREATE TABLE conversations (
                id                  TEXT PRIMARY KEY,
                participant_low     TEXT NOT NULL,
                participant_high    TEXT NOT NULL,
                last_activity_at    INTEGER NOT NULL,
                CHECK (participant_low < participant_high),
                UNIQUE (participant_low, participant_high)
            );

            CREATE INDEX idx_conversations_high
                ON conversations(participant_high, last_activity_at);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id       TEXT NOT NULL,
                receiver_id     TEXT NOT NULL,
                content         TEXT NOT NULL CHECK (length(content) > 0),
                created_at      INTEGER NOT NULL,
                is_read         INTEGER NOT NULL DEFAULT 0,
                CHECK (sender_id <> receiver_id)
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at, id);

            CREATE INDEX idx_messages_unread
                ON messages(conversation_id, receiver_id, is_read);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
