//! Hush client core.
//!
//! Every two-party conversation has one AES-256-GCM key. This crate turns
//! that key into a working chat view:
//!
//! - [`KeyCache`]: session-scoped local store of portable keys, purged on logout
//! - [`ConversationKeyResolver`]: cache first, else import the conversation's stored blob
//! - [`MessageSyncEngine`]: historical load + live subscription with id deduplication
//! - [`ChatSession`]: signed-in user, conversation list, composer, logout
//! - [`BackendPort`]: everything the client needs from the backend, implemented by
//!   [`memory::MemoryBackend`] (in-process) and [`remote::RemoteBackend`] (HTTP + WebSocket)

pub mod backend;
pub mod config;
pub mod error;
pub mod key_cache;
pub mod memory;
pub mod oauth;
pub mod remote;
pub mod resolver;
pub mod session;
pub mod sync;
pub mod timeline;

pub use backend::{BackendPort, Subscription};
pub use config::ClientConfig;
pub use error::{CacheError, ClientError, ConfigError, NetworkError, SubscriptionError};
pub use key_cache::KeyCache;
pub use resolver::{ConversationKeyResolver, KeySource, ResolvedKey};
pub use session::ChatSession;
pub use sync::{ApplyOutcome, LoadFailure, LoadedConversation, MessageSyncEngine, PendingLoad, SyncState, SyncUpdate};
pub use timeline::{DecryptedMessage, Timeline, TimelineEntry};
