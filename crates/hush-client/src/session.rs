use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

use hush_crypto::{encrypt_message, keys};
use hush_types::models::{Conversation, ConversationSummary, Message, UserIdentity};

use crate::backend::BackendPort;
use crate::error::{ClientError, NetworkError};
use crate::key_cache::KeyCache;
use crate::resolver::ConversationKeyResolver;
use crate::sync::{ApplyOutcome, MessageSyncEngine, SyncUpdate};

/// A signed-in user's chat: conversation list, the open conversation and
/// the composer.
///
/// Sent messages are not added to the timeline here. They come back through
/// the live channel like everyone else's, so while the channel is down a
/// self-sent message only shows up after a reload.
pub struct ChatSession {
    backend: Arc<dyn BackendPort>,
    cache: Arc<KeyCache>,
    user: UserIdentity,
    engine: MessageSyncEngine,
    draft: String,
}

impl ChatSession {
    /// Fails with [`ClientError::NotSignedIn`] if the backend has no current user.
    pub async fn start(backend: Arc<dyn BackendPort>, cache: Arc<KeyCache>) -> Result<Self, ClientError> {
        let user = backend.current_user().await?.ok_or(ClientError::NotSignedIn)?;
        cache.bind_owner(user.id)?;

        let resolver = ConversationKeyResolver::new(cache.clone());
        let engine = MessageSyncEngine::new(backend.clone(), resolver);
        info!("Session started for {} ({})", user.username, user.id);

        Ok(Self {
            backend,
            cache,
            user,
            engine,
            draft: String::new(),
        })
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn engine(&self) -> &MessageSyncEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut MessageSyncEngine {
        &mut self.engine
    }

    /// Newest first.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        Ok(self.backend.list_conversations(self.user.id).await?)
    }

    /// Opens the existing conversation with `partner`, creating it (and its
    /// key) if the pair has none yet.
    pub async fn start_conversation(&mut self, partner: Uuid) -> Result<Conversation, ClientError> {
        if partner == self.user.id {
            return Err(ClientError::SelfConversation);
        }

        let conversation = match self.backend.find_conversation(self.user.id, partner).await? {
            Some(existing) => existing,
            None => self.create_conversation(partner).await?,
        };

        self.engine.open(conversation.clone()).await?;
        Ok(conversation)
    }

    async fn create_conversation(&self, partner: Uuid) -> Result<Conversation, ClientError> {
        let (_, portable) = keys::generate();
        match self
            .backend
            .create_conversation(self.user.id, partner, &portable)
            .await
        {
            Ok(conversation) => {
                self.cache.put(conversation.id, &portable)?;
                info!("Created conversation {} with {}", conversation.id, partner);
                Ok(conversation)
            }
            Err(NetworkError::Conflict) => {
                // The partner created it first; use theirs
                warn!("Conversation with {} already exists, looking it up", partner);
                self.backend
                    .find_conversation(self.user.id, partner)
                    .await?
                    .ok_or(ClientError::Network(NetworkError::Conflict))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn open(&mut self, conversation: Conversation) -> Result<ApplyOutcome, ClientError> {
        if !conversation.involves(self.user.id) {
            return Err(ClientError::NotParticipant(conversation.id));
        }
        self.engine.open(conversation).await
    }

    pub async fn retry(&mut self) -> Result<ApplyOutcome, ClientError> {
        self.engine.retry().await
    }

    pub async fn next_update(&mut self) -> Option<SyncUpdate> {
        self.engine.next_update().await
    }

    pub fn drain_pending(&mut self) -> Vec<SyncUpdate> {
        self.engine.drain_pending()
    }

    /// Encrypts and appends `text` to the open conversation. Blank text is
    /// not sent and yields `Ok(None)`.
    pub async fn send_text(&self, text: &str) -> Result<Option<Message>, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let (conversation, key) = self.engine.active_key().ok_or(ClientError::NoConversationOpen)?;
        let (ciphertext, iv) = encrypt_message(key, text)?;
        let message = self
            .backend
            .append_message(conversation.id, self.user.id, &ciphertext, &iv)
            .await?;
        Ok(Some(message))
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft.zeroize();
        self.draft = text.into();
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Sends the composer text. The draft is kept if sending fails.
    pub async fn send_draft(&mut self) -> Result<Option<Message>, ClientError> {
        let sent = self.send_text(&self.draft).await?;
        self.draft.zeroize();
        Ok(sent)
    }

    /// Closes the live channel and purges every cached key.
    pub async fn logout(mut self) -> Result<(), ClientError> {
        self.engine.shutdown().await;
        self.draft.zeroize();
        self.cache.clear()?;
        info!("{} ({}) logged out", self.user.username, self.user.id);
        Ok(())
    }
}
