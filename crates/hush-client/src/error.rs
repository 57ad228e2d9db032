use thiserror::Error;
use uuid::Uuid;

use hush_crypto::{EncryptionError, KeyImportError};

/// A backend call failed at the transport or protocol level.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("backend rejected request ({status}): {reason}")]
    Status { status: u16, reason: String },

    #[error("record already exists")]
    Conflict,

    #[error("not signed in")]
    Unauthenticated,

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// The live channel could not be opened or went away.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("could not open live channel for {conversation_id}: {reason}")]
    Open { conversation_id: Uuid, reason: String },

    #[error("live channel for {conversation_id} dropped")]
    Dropped { conversation_id: Uuid },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("key cache storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("key cache lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("conversation key is corrupted: {0}")]
    KeyImport(#[from] KeyImportError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("no current user; sign in first")]
    NotSignedIn,

    #[error("no conversation is open")]
    NoConversationOpen,

    #[error("cannot start a conversation with yourself")]
    SelfConversation,

    #[error("conversation {0} does not include the signed-in user")]
    NotParticipant(Uuid),
}

impl ClientError {
    /// Network and live-channel failures clear up on reselect; corrupted keys do not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Subscription(_) | Self::Cache(_))
    }
}
