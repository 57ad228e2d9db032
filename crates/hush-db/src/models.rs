//! Database row types — these map directly to SQLite rows.
//! Conversion into the shared hush-types records happens here so callers
//! never see raw TEXT ids or timestamps.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use hush_types::models::{Conversation, ConversationSummary, Message, UserIdentity};

pub struct UserRow {
    pub id: String,
    pub username: String,
}

pub struct ConversationRow {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub key_blob: String,
    pub created_at: String,
}

/// A conversation joined with the partner's user row.
pub struct ConversationListRow {
    pub conversation: ConversationRow,
    pub partner_id: String,
    pub partner_username: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub created_at: String,
}

/// Fixed-width RFC 3339 with microseconds, so TEXT order is time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by hand in sqlite3 use "YYYY-MM-DD HH:MM:SS" without timezone.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("Corrupt timestamp '{}'", raw))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("Corrupt {} '{}'", what, raw))
}

impl UserRow {
    pub fn into_identity(self) -> Result<UserIdentity> {
        Ok(UserIdentity {
            id: parse_id(&self.id, "user id")?,
            username: self.username,
        })
    }
}

impl ConversationRow {
    pub fn into_conversation(self) -> Result<Conversation> {
        Ok(Conversation {
            id: parse_id(&self.id, "conversation id")?,
            participant_a: parse_id(&self.participant_a, "participant_a")?,
            participant_b: parse_id(&self.participant_b, "participant_b")?,
            key_blob: self.key_blob,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl ConversationListRow {
    pub fn into_summary(self) -> Result<ConversationSummary> {
        Ok(ConversationSummary {
            conversation: self.conversation.into_conversation()?,
            partner: UserIdentity {
                id: parse_id(&self.partner_id, "partner id")?,
                username: self.partner_username,
            },
        })
    }
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id, "message id")?,
            conversation_id: parse_id(&self.conversation_id, "conversation id")?,
            sender_id: parse_id(&self.sender_id, "sender id")?,
            ciphertext: self.ciphertext,
            iv: self.iv,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}
