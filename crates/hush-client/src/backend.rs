use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hush_crypto::PortableKey;
use hush_types::models::{Conversation, ConversationSummary, Message, UserIdentity};

use crate::error::{NetworkError, SubscriptionError};

/// Everything the client needs from the backend.
///
/// Ciphertext and IV bytes are opaque to the backend and must come back
/// exactly as they were appended.
#[async_trait]
pub trait BackendPort: Send + Sync {
    async fn current_user(&self) -> Result<Option<UserIdentity>, NetworkError>;

    /// Fails with [`NetworkError::Conflict`] if the pair already has a conversation.
    async fn create_conversation(
        &self,
        participant_a: Uuid,
        participant_b: Uuid,
        key_blob: &PortableKey,
    ) -> Result<Conversation, NetworkError>;

    /// Looks the pair up in either order.
    async fn find_conversation(
        &self,
        participant_a: Uuid,
        participant_b: Uuid,
    ) -> Result<Option<Conversation>, NetworkError>;

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>, NetworkError>;

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        ciphertext: &[u8],
        iv: &[u8],
    ) -> Result<Message, NetworkError>;

    /// Ascending creation time, id breaking ties.
    async fn fetch_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, NetworkError>;

    /// Resolves once the backend is delivering inserts for `conversation_id`.
    async fn subscribe(&self, conversation_id: Uuid) -> Result<Subscription, SubscriptionError>;

    async fn unsubscribe(&self, subscription: Subscription);
}

/// Live insert feed for one conversation.
///
/// The backend side pushes into the channel and watches the token. After
/// [`Subscription::cancel`] (or drop) the backend must stop delivering, and
/// nothing sent afterwards is ever observed through this handle.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    conversation_id: Uuid,
    events: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        conversation_id: Uuid,
        events: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            events,
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Next pushed insert. `None` once the backend side has gone away or the
    /// subscription was cancelled. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.events.recv() => msg,
        }
    }

    /// An already-buffered insert, without waiting.
    pub fn try_recv(&mut self) -> Result<Message, TryRecvError> {
        if self.cancel.is_cancelled() {
            return Err(TryRecvError::Disconnected);
        }
        self.events.try_recv()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
