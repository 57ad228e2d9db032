use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            participant_a   TEXT NOT NULL REFERENCES users(id),
            participant_b   TEXT NOT NULL REFERENCES users(id),
            key_blob        TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            CHECK (participant_a <> participant_b)
        );

        -- One conversation per unordered pair
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_pair
            ON conversations(min(participant_a, participant_b), max(participant_a, participant_b));

        CREATE INDEX IF NOT EXISTS idx_conversations_a ON conversations(participant_a);
        CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations(participant_b);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            ciphertext      BLOB NOT NULL,
            iv              BLOB NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at, id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
