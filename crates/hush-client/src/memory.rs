//! In-process backend.
//!
//! One [`MemoryStore`] plays the relational store and the push channel; each
//! [`MemoryBackend`] is a connection to it authenticated as one user. Used by
//! tests and by tools that want a chat without a server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use hush_crypto::PortableKey;
use hush_types::models::{Conversation, ConversationSummary, Message, UserIdentity};

use crate::backend::{BackendPort, Subscription};
use crate::error::{NetworkError, SubscriptionError};

struct Subscriber {
    events: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.events.is_closed()
    }
}

#[derive(Default)]
struct StoreInner {
    users: HashMap<Uuid, UserIdentity>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    subscribers: HashMap<Uuid, Vec<Subscriber>>,
    offline: bool,
    last_timestamp: Option<DateTime<Utc>>,
}

impl StoreInner {
    /// Strictly increasing, like a server clock that never hands out the same instant twice.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn check_online(&self) -> Result<(), NetworkError> {
        if self.offline {
            Err(NetworkError::Transport("backend unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn conversation(&self, id: Uuid) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn publish(&mut self, message: &Message) {
        if let Some(subscribers) = self.subscribers.get_mut(&message.conversation_id) {
            subscribers.retain(Subscriber::is_live);
            for subscriber in subscribers.iter() {
                let _ = subscriber.events.send(message.clone());
            }
        }
    }
}

/// Shared state behind every [`MemoryBackend`] handed out by [`MemoryStore::connect`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic while holding the lock cannot leave the maps half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, username: &str) -> UserIdentity {
        let user = UserIdentity {
            id: Uuid::new_v4(),
            username: username.to_string(),
        };
        self.lock().users.insert(user.id, user.clone());
        user
    }

    /// A backend handle signed in as `user`.
    pub fn connect(&self, user: &UserIdentity) -> MemoryBackend {
        MemoryBackend {
            store: self.clone(),
            user: Some(user.id),
        }
    }

    /// A backend handle with nobody signed in.
    pub fn anonymous(&self) -> MemoryBackend {
        MemoryBackend {
            store: self.clone(),
            user: None,
        }
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Push an already-stored message to subscribers again.
    pub fn redeliver(&self, message: &Message) {
        self.lock().publish(message);
    }

    /// Push `message` to the subscribers of `conversation_id` whatever the
    /// message itself says. Nothing is stored.
    pub fn deliver_raw(&self, conversation_id: Uuid, message: Message) {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(&conversation_id) {
            subscribers.retain(Subscriber::is_live);
            for subscriber in subscribers.iter() {
                let _ = subscriber.events.send(message.clone());
            }
        }
    }

    /// Simulate the push channel going away for a conversation.
    pub fn drop_subscriptions(&self, conversation_id: Uuid) {
        self.lock().subscribers.remove(&conversation_id);
    }

    /// Live subscriptions for a conversation.
    pub fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        self.lock()
            .subscribers
            .get(&conversation_id)
            .map(|subs| subs.iter().filter(|s| s.is_live()).count())
            .unwrap_or(0)
    }

    /// Store a message directly, bypassing participant checks.
    pub fn insert_message(&self, conversation_id: Uuid, sender_id: Uuid, ciphertext: Vec<u8>, iv: Vec<u8>) -> Message {
        let mut inner = self.lock();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            ciphertext,
            iv,
            created_at: inner.next_timestamp(),
        };
        inner.messages.push(message.clone());
        inner.publish(&message);
        message
    }
}

pub struct MemoryBackend {
    store: MemoryStore,
    user: Option<Uuid>,
}

impl MemoryBackend {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn caller(&self) -> Result<Uuid, NetworkError> {
        self.user.ok_or(NetworkError::Unauthenticated)
    }

    fn forbidden(what: &str) -> NetworkError {
        NetworkError::Status {
            status: 403,
            reason: what.to_string(),
        }
    }
}

#[async_trait]
impl BackendPort for MemoryBackend {
    async fn current_user(&self) -> Result<Option<UserIdentity>, NetworkError> {
        let inner = self.store.lock();
        inner.check_online()?;
        Ok(self.user.and_then(|id| inner.users.get(&id).cloned()))
    }

    async fn create_conversation(
        &self,
        participant_a: Uuid,
        participant_b: Uuid,
        key_blob: &PortableKey,
    ) -> Result<Conversation, NetworkError> {
        let caller = self.caller()?;
        let mut inner = self.store.lock();
        inner.check_online()?;

        if participant_a == participant_b {
            return Err(NetworkError::Status {
                status: 400,
                reason: "participants must differ".into(),
            });
        }
        if caller != participant_a && caller != participant_b {
            return Err(Self::forbidden("caller is not a participant"));
        }
        if inner
            .conversations
            .iter()
            .any(|c| c.is_between(participant_a, participant_b))
        {
            return Err(NetworkError::Conflict);
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            participant_a,
            participant_b,
            key_blob: key_blob.as_str().to_string(),
            created_at: inner.next_timestamp(),
        };
        inner.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn find_conversation(
        &self,
        participant_a: Uuid,
        participant_b: Uuid,
    ) -> Result<Option<Conversation>, NetworkError> {
        let caller = self.caller()?;
        let inner = self.store.lock();
        inner.check_online()?;
        if caller != participant_a && caller != participant_b {
            return Err(Self::forbidden("caller is not a participant"));
        }
        Ok(inner
            .conversations
            .iter()
            .find(|c| c.is_between(participant_a, participant_b))
            .cloned())
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>, NetworkError> {
        if self.caller()? != user_id {
            return Err(Self::forbidden("can only list your own conversations"));
        }
        let inner = self.store.lock();
        inner.check_online()?;

        let mut summaries: Vec<ConversationSummary> = inner
            .conversations
            .iter()
            .filter_map(|conversation| {
                let partner_id = conversation.partner_of(user_id)?;
                let partner = inner.users.get(&partner_id).cloned().unwrap_or(UserIdentity {
                    id: partner_id,
                    username: String::new(),
                });
                Some(ConversationSummary {
                    conversation: conversation.clone(),
                    partner,
                })
            })
            .collect();
        summaries.sort_by(|a, b| {
            (b.conversation.created_at, b.conversation.id).cmp(&(a.conversation.created_at, a.conversation.id))
        });
        Ok(summaries)
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        ciphertext: &[u8],
        iv: &[u8],
    ) -> Result<Message, NetworkError> {
        let caller = self.caller()?;
        let mut inner = self.store.lock();
        inner.check_online()?;

        if sender_id != caller {
            return Err(Self::forbidden("sender must be the caller"));
        }
        match inner.conversation(conversation_id) {
            Some(c) if c.involves(caller) => {}
            Some(_) => return Err(Self::forbidden("caller is not a participant")),
            None => {
                return Err(NetworkError::Status {
                    status: 404,
                    reason: "conversation not found".into(),
                });
            }
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            ciphertext: ciphertext.to_vec(),
            iv: iv.to_vec(),
            created_at: inner.next_timestamp(),
        };
        inner.messages.push(message.clone());
        inner.publish(&message);
        Ok(message)
    }

    async fn fetch_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, NetworkError> {
        let caller = self.caller()?;
        let inner = self.store.lock();
        inner.check_online()?;
        match inner.conversation(conversation_id) {
            Some(c) if c.involves(caller) => {}
            _ => return Err(Self::forbidden("caller is not a participant")),
        }

        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(Message::order_key);
        Ok(messages)
    }

    async fn subscribe(&self, conversation_id: Uuid) -> Result<Subscription, SubscriptionError> {
        let open_error = |reason: &str| SubscriptionError::Open {
            conversation_id,
            reason: reason.to_string(),
        };

        let caller = self.user.ok_or_else(|| open_error("not signed in"))?;
        let mut inner = self.store.lock();
        if inner.offline {
            return Err(open_error("backend unreachable"));
        }
        match inner.conversation(conversation_id) {
            Some(c) if c.involves(caller) => {}
            _ => return Err(open_error("not a participant")),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        inner.subscribers.entry(conversation_id).or_default().push(Subscriber {
            events: tx,
            cancel: cancel.clone(),
        });
        debug!("Memory subscription opened for {}", conversation_id);

        Ok(Subscription::new(conversation_id, rx, cancel))
    }

    async fn unsubscribe(&self, mut subscription: Subscription) {
        subscription.cancel();
        let mut inner = self.store.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(&subscription.conversation_id()) {
            subscribers.retain(Subscriber::is_live);
        }
        debug!("Memory subscription closed for {}", subscription.conversation_id());
    }
}
