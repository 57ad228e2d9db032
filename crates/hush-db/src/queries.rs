use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::Database;
use crate::models::{ConversationListRow, ConversationRow, MessageRow, UserRow, format_timestamp};

/// Result of [`Database::create_conversation`].
pub enum CreateOutcome {
    Created(ConversationRow),
    /// The pair already has a conversation; nothing was written.
    Exists(ConversationRow),
}

impl Database {
    // -- Users --

    /// Record (or refresh) the display name the identity provider reports for a user.
    pub fn upsert_user(&self, id: &str, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username",
                (id, username),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row("SELECT id, username FROM users WHERE id = ?1", [id], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    // -- Conversations --

    /// Insert a conversation unless the unordered pair already has one.
    /// Check and insert run in one transaction.
    pub fn create_conversation(
        &self,
        id: &str,
        participant_a: &str,
        participant_b: &str,
        key_blob: &str,
        created_at: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if let Some(existing) = query_conversation_between(&tx, participant_a, participant_b)? {
                return Ok(CreateOutcome::Exists(existing));
            }

            let created_at = format_timestamp(created_at);
            tx.execute(
                "INSERT INTO conversations (id, participant_a, participant_b, key_blob, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, participant_a, participant_b, key_blob, &created_at),
            )?;
            tx.commit()?;

            Ok(CreateOutcome::Created(ConversationRow {
                id: id.to_string(),
                participant_a: participant_a.to_string(),
                participant_b: participant_b.to_string(),
                key_blob: key_blob.to_string(),
                created_at,
            }))
        })
    }

    pub fn find_conversation(&self, a: &str, b: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation_between(conn, a, b))
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, participant_a, participant_b, key_blob, created_at
                     FROM conversations WHERE id = ?1",
                    [id],
                    conversation_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// All conversations `user_id` takes part in, newest first, each joined
    /// with the partner's display name.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationListRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.participant_a, c.participant_b, c.key_blob, c.created_at,
                        p.id, p.username
                 FROM conversations c
                 JOIN users p
                   ON p.id = CASE WHEN c.participant_a = ?1 THEN c.participant_b ELSE c.participant_a END
                 WHERE c.participant_a = ?1 OR c.participant_b = ?1
                 ORDER BY c.created_at DESC, c.id DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationListRow {
                        conversation: conversation_from_row(row)?,
                        partner_id: row.get(5)?,
                        partner_username: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        ciphertext: &[u8],
        iv: &[u8],
        created_at: DateTime<Utc>,
    ) -> Result<MessageRow> {
        let created_at = format_timestamp(created_at);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, ciphertext, iv, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, conversation_id, sender_id, ciphertext, iv, &created_at],
            )?;
            Ok(())
        })?;

        Ok(MessageRow {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            ciphertext: ciphertext.to_vec(),
            iv: iv.to_vec(),
            created_at,
        })
    }

    /// Full history of a conversation, oldest first.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender_id, ciphertext, iv, created_at
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;

            let rows = stmt
                .query_map([conversation_id], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        ciphertext: row.get(3)?,
                        iv: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        key_blob: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn query_conversation_between(conn: &Connection, a: &str, b: &str) -> Result<Option<ConversationRow>> {
    let row = conn
        .query_row(
            "SELECT id, participant_a, participant_b, key_blob, created_at
             FROM conversations
             WHERE (participant_a = ?1 AND participant_b = ?2)
                OR (participant_a = ?2 AND participant_b = ?1)
             LIMIT 1",
            [a, b],
            conversation_from_row,
        )
        .optional()?;
    Ok(row)
}
