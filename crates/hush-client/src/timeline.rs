use std::collections::HashSet;

use tracing::warn;
use uuid::Uuid;
use zeroize::Zeroize;

use hush_crypto::{ChatKey, DecryptionError, decrypt_message};
use hush_types::models::Message;

/// A message with its plaintext. Only ever held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub message: Message,
    pub plaintext: String,
}

/// One row of the open conversation. Messages that fail authentication stay
/// in the timeline as `Undecryptable` so the failure is visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    Decrypted(DecryptedMessage),
    Undecryptable { message: Message, error: DecryptionError },
}

impl TimelineEntry {
    pub fn decrypt(key: &ChatKey, message: Message) -> Self {
        match decrypt_message(key, &message.ciphertext, &message.iv) {
            Ok(plaintext) => Self::Decrypted(DecryptedMessage { message, plaintext }),
            Err(error) => {
                warn!("Message {} could not be decrypted: {}", message.id, error);
                Self::Undecryptable { message, error }
            }
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            Self::Decrypted(decrypted) => &decrypted.message,
            Self::Undecryptable { message, .. } => message,
        }
    }

    pub fn id(&self) -> Uuid {
        self.message().id
    }

    pub fn plaintext(&self) -> Option<&str> {
        match self {
            Self::Decrypted(decrypted) => Some(&decrypted.plaintext),
            Self::Undecryptable { .. } => None,
        }
    }

    pub fn is_decrypted(&self) -> bool {
        matches!(self, Self::Decrypted(_))
    }
}

/// Ordered, duplicate-free message list for the selected conversation.
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    seen: HashSet<Uuid>,
}

impl Timeline {
    /// Builds the initial list from a historical snapshot: sorted by
    /// creation time then id, repeated ids kept once.
    pub fn from_history(mut history: Vec<TimelineEntry>) -> Self {
        history.sort_by_key(|entry| entry.message().order_key());
        let mut timeline = Self::default();
        for entry in history {
            timeline.push(entry);
        }
        timeline
    }

    /// Appends unless the id is already present. Returns whether it was appended.
    pub fn push(&mut self, entry: TimelineEntry) -> bool {
        if !self.seen.insert(entry.id()) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.seen.contains(&id)
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            if let TimelineEntry::Decrypted(decrypted) = entry {
                decrypted.plaintext.zeroize();
            }
        }
        self.entries.clear();
        self.seen.clear();
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        self.clear();
    }
}
