//! Historical load + live feed for the selected conversation.
//!
//! Opening a conversation runs in three steps so a result that arrives after
//! the user has moved on can be recognised and thrown away:
//!
//! 1. [`MessageSyncEngine::begin_open`] tears down the previous conversation,
//!    resets the timeline and resolves the key.
//! 2. [`PendingLoad::load`] subscribes, then fetches and decrypts the history.
//!    It owns everything it needs, so it can run while the engine is borrowed
//!    elsewhere.
//! 3. [`MessageSyncEngine::apply`] installs the result, unless a newer open
//!    (or a shutdown) happened in the meantime.
//!
//! The engine and every pending load share one generation counter. A load
//! that has been overtaken never keeps a live channel open: it skips the
//! subscribe, or closes the channel as soon as it sees the counter moved.
//!
//! The subscription is opened before the snapshot is taken. Anything inserted
//! in between is both in the snapshot and buffered on the subscription, and
//! the timeline keeps it once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hush_crypto::ChatKey;
use hush_types::models::{Conversation, Message};

use crate::backend::{BackendPort, Subscription};
use crate::error::{ClientError, NetworkError, SubscriptionError};
use crate::resolver::ConversationKeyResolver;
use crate::timeline::{Timeline, TimelineEntry};

/// Why a conversation could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    /// The stored key blob is malformed. Reopening will not help.
    CorruptedKey(String),
    /// History could not be fetched.
    Network(String),
    /// The local key cache failed.
    KeyCache(String),
}

impl LoadFailure {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::CorruptedKey(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Loading { conversation_id: Uuid },
    Subscribed { conversation_id: Uuid },
    /// History is shown but live updates are not arriving.
    Degraded {
        conversation_id: Uuid,
        reason: SubscriptionError,
    },
    Failed {
        conversation_id: Uuid,
        failure: LoadFailure,
    },
}

impl SyncState {
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::Idle => None,
            Self::Loading { conversation_id }
            | Self::Subscribed { conversation_id }
            | Self::Degraded { conversation_id, .. }
            | Self::Failed { conversation_id, .. } => Some(*conversation_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The load belonged to a conversation that is no longer selected.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    Appended(TimelineEntry),
    Disconnected(SubscriptionError),
}

/// Work for step 2 of an open. See the module docs.
pub struct PendingLoad {
    generation: u64,
    current: Arc<AtomicU64>,
    conversation: Conversation,
    key: ChatKey,
    backend: Arc<dyn BackendPort>,
}

/// Result of [`PendingLoad::load`], handed to [`MessageSyncEngine::apply`].
pub struct LoadedConversation {
    generation: u64,
    conversation: Conversation,
    key: ChatKey,
    subscription: Result<Subscription, SubscriptionError>,
    history: Result<Vec<TimelineEntry>, NetworkError>,
}

impl PendingLoad {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation.id
    }

    /// False once a newer open or a shutdown has happened.
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    pub async fn load(self) -> LoadedConversation {
        let conversation_id = self.conversation.id;
        if !self.is_current() {
            debug!("Skipping superseded load for {}", conversation_id);
            return self.superseded();
        }

        let subscription = match self.backend.subscribe(conversation_id).await {
            Ok(subscription) if !self.is_current() => {
                debug!("Open of {} superseded while subscribing", conversation_id);
                self.backend.unsubscribe(subscription).await;
                return self.superseded();
            }
            Ok(subscription) => Ok(subscription),
            Err(e) => {
                warn!("Live channel unavailable for {}: {}", conversation_id, e);
                Err(e)
            }
        };

        let history = match self.backend.fetch_messages(conversation_id).await {
            Ok(messages) => Ok(messages
                .into_iter()
                .filter(|m| {
                    let ours = m.conversation_id == conversation_id;
                    if !ours {
                        warn!(
                            "Fetch for {} returned message {} from another conversation",
                            conversation_id, m.id
                        );
                    }
                    ours
                })
                .map(|m| TimelineEntry::decrypt(&self.key, m))
                .collect()),
            Err(e) => Err(e),
        };

        if !self.is_current() {
            debug!("Open of {} superseded while fetching history", conversation_id);
            if let Ok(subscription) = subscription {
                self.backend.unsubscribe(subscription).await;
            }
            return self.superseded();
        }

        LoadedConversation {
            generation: self.generation,
            conversation: self.conversation,
            key: self.key,
            subscription,
            history,
        }
    }

    /// A result `apply` will discard, carrying no live channel.
    fn superseded(self) -> LoadedConversation {
        let conversation_id = self.conversation.id;
        LoadedConversation {
            generation: self.generation,
            conversation: self.conversation,
            key: self.key,
            subscription: Err(SubscriptionError::Open {
                conversation_id,
                reason: "superseded by a newer open".into(),
            }),
            history: Ok(Vec::new()),
        }
    }
}

struct ActiveConversation {
    conversation: Conversation,
    key: ChatKey,
    subscription: Option<Subscription>,
}

/// Owns the selected conversation's timeline and its one live subscription.
pub struct MessageSyncEngine {
    backend: Arc<dyn BackendPort>,
    resolver: ConversationKeyResolver,
    state: SyncState,
    generation: Arc<AtomicU64>,
    selected: Option<Conversation>,
    active: Option<ActiveConversation>,
    timeline: Timeline,
}

impl MessageSyncEngine {
    pub fn new(backend: Arc<dyn BackendPort>, resolver: ConversationKeyResolver) -> Self {
        Self {
            backend,
            resolver,
            state: SyncState::Idle,
            generation: Arc::new(AtomicU64::new(0)),
            selected: None,
            active: None,
            timeline: Timeline::default(),
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// The conversation the user picked last, whether or not it loaded.
    pub fn selected(&self) -> Option<&Conversation> {
        self.selected.as_ref()
    }

    /// The loaded conversation, if any.
    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().map(|a| &a.conversation)
    }

    pub fn is_live(&self) -> bool {
        self.active
            .as_ref()
            .and_then(|a| a.subscription.as_ref())
            .is_some()
    }

    pub(crate) fn active_key(&self) -> Option<(&Conversation, &ChatKey)> {
        self.active.as_ref().map(|a| (&a.conversation, &a.key))
    }

    /// Step 1 of an open. The previous subscription is closed before anything
    /// else happens.
    pub async fn begin_open(
        &mut self,
        conversation: Conversation,
    ) -> Result<PendingLoad, ClientError> {
        self.teardown().await;
        self.timeline.clear();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let conversation_id = conversation.id;
        self.selected = Some(conversation.clone());
        self.state = SyncState::Loading { conversation_id };
        info!("Opening conversation {}", conversation_id);

        let resolved = match self.resolver.resolve(&conversation) {
            Ok(resolved) => resolved,
            Err(e) => {
                let failure = match &e {
                    ClientError::KeyImport(_) => LoadFailure::CorruptedKey(e.to_string()),
                    _ => LoadFailure::KeyCache(e.to_string()),
                };
                warn!("Could not resolve key for {}: {}", conversation_id, e);
                self.state = SyncState::Failed {
                    conversation_id,
                    failure,
                };
                return Err(e);
            }
        };

        Ok(PendingLoad {
            generation,
            current: self.generation.clone(),
            conversation,
            key: resolved.key,
            backend: self.backend.clone(),
        })
    }

    /// Step 3 of an open. A failed history fetch leaves the conversation in
    /// a retryable `Failed` state and returns the network error.
    pub async fn apply(&mut self, loaded: LoadedConversation) -> Result<ApplyOutcome, ClientError> {
        let LoadedConversation {
            generation,
            conversation,
            key,
            subscription,
            history,
        } = loaded;
        let conversation_id = conversation.id;

        let current = self.selected.as_ref().map(|c| c.id) == Some(conversation_id);
        if generation != self.generation.load(Ordering::SeqCst) || !current {
            debug!("Discarding stale load for {}", conversation_id);
            if let Ok(subscription) = subscription {
                self.backend.unsubscribe(subscription).await;
            }
            return Ok(ApplyOutcome::Stale);
        }

        let entries = match history {
            Ok(entries) => entries,
            Err(e) => {
                warn!("History fetch for {} failed: {}", conversation_id, e);
                if let Ok(subscription) = subscription {
                    self.backend.unsubscribe(subscription).await;
                }
                self.state = SyncState::Failed {
                    conversation_id,
                    failure: LoadFailure::Network(e.to_string()),
                };
                return Err(e.into());
            }
        };

        self.timeline = Timeline::from_history(entries);
        match subscription {
            Ok(subscription) => {
                self.active = Some(ActiveConversation {
                    conversation,
                    key,
                    subscription: Some(subscription),
                });
                self.state = SyncState::Subscribed { conversation_id };
                // Inserts that raced the snapshot
                self.drain_pending();
            }
            Err(reason) => {
                self.active = Some(ActiveConversation {
                    conversation,
                    key,
                    subscription: None,
                });
                self.state = SyncState::Degraded {
                    conversation_id,
                    reason,
                };
            }
        }

        info!(
            "Conversation {} loaded with {} messages ({:?})",
            conversation_id,
            self.timeline.len(),
            self.state
        );
        Ok(ApplyOutcome::Applied)
    }

    /// All three steps back to back.
    pub async fn open(&mut self, conversation: Conversation) -> Result<ApplyOutcome, ClientError> {
        let pending = self.begin_open(conversation).await?;
        let loaded = pending.load().await;
        self.apply(loaded).await
    }

    /// Reopen the selected conversation, e.g. after a network failure or a
    /// dropped live channel.
    pub async fn retry(&mut self) -> Result<ApplyOutcome, ClientError> {
        let conversation = self.selected.clone().ok_or(ClientError::NoConversationOpen)?;
        info!("Retrying conversation {}", conversation.id);
        self.open(conversation).await
    }

    /// Waits for the next live change to the timeline. Duplicates and events
    /// for other conversations are skipped. Returns `None` when there is no
    /// live subscription to wait on.
    ///
    /// Cancel-safe: dropping the future loses no events.
    pub async fn next_update(&mut self) -> Option<SyncUpdate> {
        loop {
            let subscription = self.active.as_mut()?.subscription.as_mut()?;
            let received = subscription.recv().await;
            match received {
                Some(message) => {
                    if let Some(entry) = self.accept(message) {
                        return Some(SyncUpdate::Appended(entry));
                    }
                }
                None => return self.mark_dropped().map(SyncUpdate::Disconnected),
            }
        }
    }

    /// Applies whatever the subscription has already buffered, without waiting.
    pub fn drain_pending(&mut self) -> Vec<SyncUpdate> {
        let mut updates = Vec::new();
        loop {
            let subscription = self.active.as_mut().and_then(|a| a.subscription.as_mut());
            let Some(subscription) = subscription else {
                break;
            };
            match subscription.try_recv() {
                Ok(message) => {
                    if let Some(entry) = self.accept(message) {
                        updates.push(SyncUpdate::Appended(entry));
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if let Some(reason) = self.mark_dropped() {
                        updates.push(SyncUpdate::Disconnected(reason));
                    }
                    break;
                }
            }
        }
        updates
    }

    /// Close the subscription, forget the selection and drop held keys.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
        self.timeline.clear();
        self.selected = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.resolver.forget_all();
        self.state = SyncState::Idle;
        info!("Message sync stopped");
    }

    fn accept(&mut self, message: Message) -> Option<TimelineEntry> {
        let active = self.active.as_ref()?;
        if message.conversation_id != active.conversation.id {
            warn!(
                "Dropping message {} for {} delivered to {}",
                message.id, message.conversation_id, active.conversation.id
            );
            return None;
        }
        if self.timeline.contains(message.id) {
            debug!("Dropping duplicate delivery of {}", message.id);
            return None;
        }

        let entry = TimelineEntry::decrypt(&active.key, message);
        self.timeline.push(entry.clone());
        Some(entry)
    }

    fn mark_dropped(&mut self) -> Option<SubscriptionError> {
        let active = self.active.as_mut()?;
        active.subscription.take()?;

        let conversation_id = active.conversation.id;
        let reason = SubscriptionError::Dropped { conversation_id };
        warn!("{}", reason);
        self.state = SyncState::Degraded {
            conversation_id,
            reason: reason.clone(),
        };
        Some(reason)
    }

    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        if let Some(subscription) = active.subscription {
            debug!("Closing live channel for {}", active.conversation.id);
            self.backend.unsubscribe(subscription).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hush_crypto::{DecryptionError, PortableKey, encrypt_message, keys};
    use hush_types::models::{ConversationSummary, UserIdentity};

    use crate::key_cache::KeyCache;
    use crate::memory::{MemoryBackend, MemoryStore};

    struct Fixture {
        store: MemoryStore,
        alice: UserIdentity,
        bob: UserIdentity,
        conversation: Conversation,
        key: ChatKey,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let alice = store.register("alice");
        let bob = store.register("bob");
        let (key, portable) = keys::generate();
        let conversation = store
            .connect(&alice)
            .create_conversation(alice.id, bob.id, &portable)
            .await
            .unwrap();
        Fixture {
            store,
            alice,
            bob,
            conversation,
            key,
        }
    }

    impl Fixture {
        fn engine(&self, user: &UserIdentity) -> MessageSyncEngine {
            engine_with(Arc::new(self.store.connect(user)))
        }

        async fn send(&self, from: &UserIdentity, text: &str) -> Message {
            send_in(&self.store, from, &self.conversation, &self.key, text).await
        }

        /// Bob's conversation with a third user.
        async fn second_conversation(&self) -> (Conversation, ChatKey, UserIdentity) {
            let carol = self.store.register("carol");
            let (key, portable) = keys::generate();
            let conversation = self
                .store
                .connect(&self.bob)
                .create_conversation(self.bob.id, carol.id, &portable)
                .await
                .unwrap();
            (conversation, key, carol)
        }
    }

    fn engine_with(backend: Arc<dyn BackendPort>) -> MessageSyncEngine {
        let resolver = ConversationKeyResolver::new(Arc::new(KeyCache::in_memory().unwrap()));
        MessageSyncEngine::new(backend, resolver)
    }

    async fn send_in(
        store: &MemoryStore,
        from: &UserIdentity,
        conversation: &Conversation,
        key: &ChatKey,
        text: &str,
    ) -> Message {
        let (ciphertext, iv) = encrypt_message(key, text).unwrap();
        store
            .connect(from)
            .append_message(conversation.id, from.id, &ciphertext, &iv)
            .await
            .unwrap()
    }

    fn texts(engine: &MessageSyncEngine) -> Vec<String> {
        engine
            .timeline()
            .entries()
            .iter()
            .map(|e| e.plaintext().unwrap_or("<undecryptable>").to_string())
            .collect()
    }

    #[tokio::test]
    async fn open_loads_history_then_subscribes() {
        let f = fixture().await;
        f.send(&f.alice, "one").await;
        f.send(&f.bob, "two").await;
        f.send(&f.alice, "").await;

        let mut engine = f.engine(&f.bob);
        assert_eq!(engine.state(), &SyncState::Idle);
        let outcome = engine.open(f.conversation.clone()).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(texts(&engine), ["one", "two", ""]);
        assert_eq!(
            engine.state(),
            &SyncState::Subscribed {
                conversation_id: f.conversation.id
            }
        );
        assert!(engine.is_live());
        assert_eq!(f.store.subscriber_count(f.conversation.id), 1);
    }

    #[tokio::test]
    async fn empty_conversation_subscribes() {
        let f = fixture().await;
        let mut engine = f.engine(&f.alice);
        engine.open(f.conversation.clone()).await.unwrap();
        assert!(engine.timeline().is_empty());
        assert!(engine.is_live());
    }

    #[tokio::test]
    async fn corrupted_history_entry_does_not_block_the_rest() {
        let f = fixture().await;
        f.send(&f.alice, "before").await;
        f.store
            .insert_message(f.conversation.id, f.alice.id, vec![1, 2, 3], vec![0; 12]);
        f.send(&f.alice, "after").await;

        let mut engine = f.engine(&f.bob);
        engine.open(f.conversation.clone()).await.unwrap();

        assert_eq!(texts(&engine), ["before", "<undecryptable>", "after"]);
        assert!(matches!(
            engine.timeline().entries()[1],
            TimelineEntry::Undecryptable {
                error: DecryptionError::Authentication,
                ..
            }
        ));
        assert!(engine.is_live());
    }

    #[tokio::test]
    async fn live_insert_is_appended_after_history() {
        let f = fixture().await;
        f.send(&f.alice, "old").await;

        let mut engine = f.engine(&f.bob);
        engine.open(f.conversation.clone()).await.unwrap();
        let sent = f.send(&f.alice, "hello").await;

        match engine.next_update().await {
            Some(SyncUpdate::Appended(TimelineEntry::Decrypted(d))) => {
                assert_eq!(d.plaintext, "hello");
                assert_eq!(d.message.sender_id, f.alice.id);
                assert_eq!(d.message.id, sent.id);
            }
            other => panic!("unexpected update: {:?}", other),
        }
        assert_eq!(texts(&engine), ["old", "hello"]);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_kept_once() {
        let f = fixture().await;
        let mut engine = f.engine(&f.bob);
        engine.open(f.conversation.clone()).await.unwrap();

        let sent = f.send(&f.alice, "once").await;
        f.store.redeliver(&sent);

        let updates = engine.drain_pending();
        assert_eq!(updates.len(), 1);
        assert_eq!(engine.timeline().len(), 1);

        // A redelivery of something already in history is dropped too
        f.store.redeliver(&sent);
        assert!(engine.drain_pending().is_empty());
        assert_eq!(engine.timeline().len(), 1);
    }

    #[tokio::test]
    async fn next_update_skips_duplicates() {
        let f = fixture().await;
        let mut engine = f.engine(&f.bob);
        engine.open(f.conversation.clone()).await.unwrap();

        let first = f.send(&f.alice, "first").await;
        f.store.redeliver(&first);
        f.send(&f.alice, "second").await;

        let mut received = Vec::new();
        for _ in 0..2 {
            match engine.next_update().await {
                Some(SyncUpdate::Appended(entry)) => {
                    received.push(entry.plaintext().unwrap().to_string())
                }
                other => panic!("unexpected update: {:?}", other),
            }
        }
        assert_eq!(received, ["first", "second"]);
        assert_eq!(engine.timeline().len(), 2);
    }

    #[tokio::test]
    async fn switching_conversations_is_exclusive() {
        let f = fixture().await;
        let (other, other_key, carol) = f.second_conversation().await;
        f.send(&f.alice, "from a").await;

        let mut engine = f.engine(&f.bob);
        engine.open(f.conversation.clone()).await.unwrap();
        assert_eq!(texts(&engine), ["from a"]);

        engine.open(other.clone()).await.unwrap();
        assert_eq!(f.store.subscriber_count(f.conversation.id), 0);
        assert_eq!(f.store.subscriber_count(other.id), 1);
        assert!(engine.timeline().is_empty());

        // Late traffic for the old conversation never shows up
        f.send(&f.alice, "late for a").await;
        let foreign = f.send(&f.alice, "misrouted").await;
        f.store.deliver_raw(other.id, foreign);
        assert!(engine.drain_pending().is_empty());

        send_in(&f.store, &carol, &other, &other_key, "from b").await;
        engine.drain_pending();
        assert_eq!(texts(&engine), ["from b"]);
        assert_eq!(engine.active_conversation(), Some(&other));
    }

    #[tokio::test]
    async fn stale_load_is_discarded() {
        let f = fixture().await;
        let (other, _, _) = f.second_conversation().await;
        f.send(&f.alice, "in a").await;

        let mut engine = f.engine(&f.bob);
        let pending_a = engine.begin_open(f.conversation.clone()).await.unwrap();
        let pending_b = engine.begin_open(other.clone()).await.unwrap();
        assert!(!pending_a.is_current());

        let loaded_b = pending_b.load().await;
        assert_eq!(engine.apply(loaded_b).await.unwrap(), ApplyOutcome::Applied);

        // The overtaken load finishes last and never holds a channel
        let loaded_a = pending_a.load().await;
        assert_eq!(f.store.subscriber_count(f.conversation.id), 0);
        assert_eq!(f.store.subscriber_count(other.id), 1);

        assert_eq!(engine.apply(loaded_a).await.unwrap(), ApplyOutcome::Stale);
        assert!(engine.timeline().is_empty());
        assert_eq!(engine.active_conversation(), Some(&other));
        assert_eq!(
            engine.state(),
            &SyncState::Subscribed {
                conversation_id: other.id
            }
        );
    }

    #[tokio::test]
    async fn load_overtaken_while_subscribing_closes_its_channel() {
        let f = fixture().await;
        let generation = Arc::new(AtomicU64::new(0));
        let backend = OvertakingBackend {
            inner: f.store.connect(&f.bob),
            generation: generation.clone(),
        };
        let mut engine = engine_with(Arc::new(backend));
        engine.generation = generation;

        let pending = engine.begin_open(f.conversation.clone()).await.unwrap();
        let loaded = pending.load().await;
        assert_eq!(f.store.subscriber_count(f.conversation.id), 0);
        assert_eq!(engine.apply(loaded).await.unwrap(), ApplyOutcome::Stale);
    }

    #[tokio::test]
    async fn reopening_same_conversation_discards_older_load() {
        let f = fixture().await;
        let mut engine = f.engine(&f.bob);

        let first = engine.begin_open(f.conversation.clone()).await.unwrap();
        let second = engine.begin_open(f.conversation.clone()).await.unwrap();
        let loaded_first = first.load().await;

        assert_eq!(engine.apply(loaded_first).await.unwrap(), ApplyOutcome::Stale);
        assert_eq!(engine.apply(second.load().await).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(f.store.subscriber_count(f.conversation.id), 1);
    }

    #[tokio::test]
    async fn load_finishing_after_shutdown_is_discarded() {
        let f = fixture().await;
        let mut engine = f.engine(&f.bob);

        let pending = engine.begin_open(f.conversation.clone()).await.unwrap();
        engine.shutdown().await;
        let loaded = pending.load().await;

        assert_eq!(engine.apply(loaded).await.unwrap(), ApplyOutcome::Stale);
        assert_eq!(engine.state(), &SyncState::Idle);
        assert_eq!(f.store.subscriber_count(f.conversation.id), 0);
    }

    #[tokio::test]
    async fn fetch_failure_is_retryable() {
        let f = fixture().await;
        f.send(&f.alice, "kept").await;
        let mut engine = f.engine(&f.bob);

        f.store.set_offline(true);
        let err = engine.open(f.conversation.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        match engine.state() {
            SyncState::Failed { failure, .. } => assert!(failure.is_retryable()),
            other => panic!("unexpected state: {:?}", other),
        }

        f.store.set_offline(false);
        engine.retry().await.unwrap();
        assert_eq!(texts(&engine), ["kept"]);
        assert!(engine.is_live());
    }

    #[tokio::test]
    async fn corrupted_key_fails_without_subscribing() {
        let f = fixture().await;
        let mut broken = f.conversation.clone();
        broken.key_blob = "AAAA".into();

        let mut engine = f.engine(&f.bob);
        let err = engine.open(broken).await.unwrap_err();
        assert!(matches!(err, ClientError::KeyImport(_)));
        match engine.state() {
            SyncState::Failed { failure, .. } => {
                assert!(matches!(failure, LoadFailure::CorruptedKey(_)));
                assert!(!failure.is_retryable());
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert_eq!(f.store.subscriber_count(f.conversation.id), 0);
    }

    #[tokio::test]
    async fn dropped_channel_degrades_until_retry() {
        let f = fixture().await;
        let mut engine = f.engine(&f.bob);
        engine.open(f.conversation.clone()).await.unwrap();

        f.store.drop_subscriptions(f.conversation.id);
        let update = engine.next_update().await;
        assert_eq!(
            update,
            Some(SyncUpdate::Disconnected(SubscriptionError::Dropped {
                conversation_id: f.conversation.id
            }))
        );
        assert!(matches!(engine.state(), SyncState::Degraded { .. }));
        assert!(!engine.is_live());
        assert!(engine.next_update().await.is_none());

        // Missed while degraded, picked up by the reload
        f.send(&f.alice, "missed").await;
        engine.retry().await.unwrap();
        assert_eq!(texts(&engine), ["missed"]);
        assert!(engine.is_live());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let f = fixture().await;
        f.send(&f.alice, "bye").await;
        let mut engine = f.engine(&f.bob);
        engine.open(f.conversation.clone()).await.unwrap();

        engine.shutdown().await;
        assert_eq!(engine.state(), &SyncState::Idle);
        assert!(engine.timeline().is_empty());
        assert!(engine.selected().is_none());
        assert_eq!(f.store.subscriber_count(f.conversation.id), 0);
        assert!(matches!(engine.retry().await, Err(ClientError::NoConversationOpen)));

        // Held keys are gone too: with the cache emptied only the blob is left
        engine.resolver.cache().clear().unwrap();
        let mut broken = f.conversation.clone();
        broken.key_blob = "AAAA".into();
        assert!(matches!(engine.open(broken).await, Err(ClientError::KeyImport(_))));
    }

    /// Where a racing insert lands relative to the snapshot.
    #[derive(Clone, Copy)]
    enum Race {
        BeforeSnapshot,
        AfterSnapshot,
    }

    /// Inserts a message while the history fetch is in flight.
    struct RacingBackend {
        inner: MemoryBackend,
        sender: UserIdentity,
        key: ChatKey,
        race: Race,
    }

    impl RacingBackend {
        fn insert(&self, conversation_id: Uuid) {
            let (ciphertext, iv) = encrypt_message(&self.key, "raced").unwrap();
            self.inner
                .store()
                .insert_message(conversation_id, self.sender.id, ciphertext, iv);
        }
    }

    #[async_trait]
    impl BackendPort for RacingBackend {
        async fn current_user(&self) -> Result<Option<UserIdentity>, NetworkError> {
            self.inner.current_user().await
        }

        async fn create_conversation(
            &self,
            a: Uuid,
            b: Uuid,
            key_blob: &PortableKey,
        ) -> Result<Conversation, NetworkError> {
            self.inner.create_conversation(a, b, key_blob).await
        }

        async fn find_conversation(
            &self,
            a: Uuid,
            b: Uuid,
        ) -> Result<Option<Conversation>, NetworkError> {
            self.inner.find_conversation(a, b).await
        }

        async fn list_conversations(
            &self,
            user_id: Uuid,
        ) -> Result<Vec<ConversationSummary>, NetworkError> {
            self.inner.list_conversations(user_id).await
        }

        async fn append_message(
            &self,
            conversation_id: Uuid,
            sender_id: Uuid,
            ciphertext: &[u8],
            iv: &[u8],
        ) -> Result<Message, NetworkError> {
            self.inner.append_message(conversation_id, sender_id, ciphertext, iv).await
        }

        async fn fetch_messages(
            &self,
            conversation_id: Uuid,
        ) -> Result<Vec<Message>, NetworkError> {
            match self.race {
                Race::BeforeSnapshot => {
                    self.insert(conversation_id);
                    self.inner.fetch_messages(conversation_id).await
                }
                Race::AfterSnapshot => {
                    let snapshot = self.inner.fetch_messages(conversation_id).await;
                    self.insert(conversation_id);
                    snapshot
                }
            }
        }

        async fn subscribe(
            &self,
            conversation_id: Uuid,
        ) -> Result<Subscription, SubscriptionError> {
            self.inner.subscribe(conversation_id).await
        }

        async fn unsubscribe(&self, subscription: Subscription) {
            self.inner.unsubscribe(subscription).await
        }
    }

    #[tokio::test]
    async fn insert_racing_the_snapshot_arrives_exactly_once() {
        for race in [Race::BeforeSnapshot, Race::AfterSnapshot] {
            let f = fixture().await;
            f.send(&f.alice, "history").await;

            let backend = RacingBackend {
                inner: f.store.connect(&f.bob),
                sender: f.alice.clone(),
                key: f.key.clone(),
                race,
            };
            let mut engine = engine_with(Arc::new(backend));
            engine.open(f.conversation.clone()).await.unwrap();

            assert_eq!(texts(&engine), ["history", "raced"]);
            assert!(engine.drain_pending().is_empty());
        }
    }

    /// Serves history but never opens a live channel.
    struct NoPushBackend(MemoryBackend);

    #[async_trait]
    impl BackendPort for NoPushBackend {
        async fn current_user(&self) -> Result<Option<UserIdentity>, NetworkError> {
            self.0.current_user().await
        }

        async fn create_conversation(
            &self,
            a: Uuid,
            b: Uuid,
            key_blob: &PortableKey,
        ) -> Result<Conversation, NetworkError> {
            self.0.create_conversation(a, b, key_blob).await
        }

        async fn find_conversation(
            &self,
            a: Uuid,
            b: Uuid,
        ) -> Result<Option<Conversation>, NetworkError> {
            self.0.find_conversation(a, b).await
        }

        async fn list_conversations(
            &self,
            user_id: Uuid,
        ) -> Result<Vec<ConversationSummary>, NetworkError> {
            self.0.list_conversations(user_id).await
        }

        async fn append_message(
            &self,
            conversation_id: Uuid,
            sender_id: Uuid,
            ciphertext: &[u8],
            iv: &[u8],
        ) -> Result<Message, NetworkError> {
            self.0.append_message(conversation_id, sender_id, ciphertext, iv).await
        }

        async fn fetch_messages(
            &self,
            conversation_id: Uuid,
        ) -> Result<Vec<Message>, NetworkError> {
            self.0.fetch_messages(conversation_id).await
        }

        async fn subscribe(
            &self,
            conversation_id: Uuid,
        ) -> Result<Subscription, SubscriptionError> {
            Err(SubscriptionError::Open {
                conversation_id,
                reason: "gateway down".into(),
            })
        }

        async fn unsubscribe(&self, subscription: Subscription) {
            self.0.unsubscribe(subscription).await
        }
    }

    /// Bumps the open generation as soon as a subscribe completes, as a
    /// newer open landing mid-load would.
    struct OvertakingBackend {
        inner: MemoryBackend,
        generation: Arc<AtomicU64>,
    }

    #[async_trait]
    impl BackendPort for OvertakingBackend {
        async fn current_user(&self) -> Result<Option<UserIdentity>, NetworkError> {
            self.inner.current_user().await
        }

        async fn create_conversation(
            &self,
            a: Uuid,
            b: Uuid,
            key_blob: &PortableKey,
        ) -> Result<Conversation, NetworkError> {
            self.inner.create_conversation(a, b, key_blob).await
        }

        async fn find_conversation(
            &self,
            a: Uuid,
            b: Uuid,
        ) -> Result<Option<Conversation>, NetworkError> {
            self.inner.find_conversation(a, b).await
        }

        async fn list_conversations(
            &self,
            user_id: Uuid,
        ) -> Result<Vec<ConversationSummary>, NetworkError> {
            self.inner.list_conversations(user_id).await
        }

        async fn append_message(
            &self,
            conversation_id: Uuid,
            sender_id: Uuid,
            ciphertext: &[u8],
            iv: &[u8],
        ) -> Result<Message, NetworkError> {
            self.inner.append_message(conversation_id, sender_id, ciphertext, iv).await
        }

        async fn fetch_messages(
            &self,
            conversation_id: Uuid,
        ) -> Result<Vec<Message>, NetworkError> {
            self.inner.fetch_messages(conversation_id).await
        }

        async fn subscribe(
            &self,
            conversation_id: Uuid,
        ) -> Result<Subscription, SubscriptionError> {
            let subscription = self.inner.subscribe(conversation_id).await;
            self.generation.fetch_add(1, Ordering::SeqCst);
            subscription
        }

        async fn unsubscribe(&self, subscription: Subscription) {
            self.inner.unsubscribe(subscription).await
        }
    }

    #[tokio::test]
    async fn subscribe_failure_degrades_but_shows_history() {
        let f = fixture().await;
        f.send(&f.alice, "visible").await;

        let mut engine = engine_with(Arc::new(NoPushBackend(f.store.connect(&f.bob))));
        assert_eq!(engine.open(f.conversation.clone()).await.unwrap(), ApplyOutcome::Applied);

        assert_eq!(texts(&engine), ["visible"]);
        assert!(matches!(
            engine.state(),
            SyncState::Degraded {
                reason: SubscriptionError::Open { .. },
                ..
            }
        ));
        assert!(engine.active_conversation().is_some());
        assert!(engine.next_update().await.is_none());
    }

    #[test]
    fn state_reports_its_conversation() {
        let id = Uuid::new_v4();
        assert_eq!(SyncState::Idle.conversation_id(), None);
        assert_eq!(SyncState::Loading { conversation_id: id }.conversation_id(), Some(id));
        let failed = SyncState::Failed {
            conversation_id: id,
            failure: LoadFailure::Network("timeout".into()),
        };
        assert_eq!(failed.conversation_id(), Some(id));
    }
}
