use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use hush_crypto::{ChatKey, PortableKey, keys};
use hush_types::models::Conversation;
use uuid::Uuid;

use crate::error::ClientError;
use crate::key_cache::KeyCache;

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Already held for this session, or found in the local key cache.
    Cache,
    /// Imported from the conversation's stored key blob and written through.
    Imported,
}

#[derive(Debug)]
pub struct ResolvedKey {
    pub key: ChatKey,
    pub source: KeySource,
}

/// Finds the key for a conversation: keys already imported this session,
/// then the local cache, then the blob stored on the conversation record.
#[derive(Clone)]
pub struct ConversationKeyResolver {
    cache: Arc<KeyCache>,
    held: Arc<Mutex<HashMap<Uuid, ChatKey>>>,
}

impl ConversationKeyResolver {
    pub fn new(cache: Arc<KeyCache>) -> Self {
        Self {
            cache,
            held: Arc::default(),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<Uuid, ChatKey>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// A malformed stored blob fails with `KeyImport` and is not retried.
    pub fn resolve(&self, conversation: &Conversation) -> Result<ResolvedKey, ClientError> {
        if let Some(key) = self.held().get(&conversation.id) {
            debug!("Key for conversation {} already held", conversation.id);
            return Ok(ResolvedKey {
                key: key.clone(),
                source: KeySource::Cache,
            });
        }

        if let Some(cached) = self.cache.get(conversation.id)? {
            match keys::import(&cached) {
                Ok(key) => {
                    debug!("Key cache hit for conversation {}", conversation.id);
                    self.held().insert(conversation.id, key.clone());
                    return Ok(ResolvedKey {
                        key,
                        source: KeySource::Cache,
                    });
                }
                Err(e) => {
                    warn!(
                        "Cached key for conversation {} is unreadable ({}), re-importing",
                        conversation.id, e
                    );
                    self.cache.remove(conversation.id)?;
                }
            }
        }

        let portable = PortableKey::from(conversation.key_blob.as_str());
        let key = keys::import(&portable)?;
        self.cache.put(conversation.id, &portable)?;
        self.held().insert(conversation.id, key.clone());
        info!("Imported key for conversation {}", conversation.id);

        Ok(ResolvedKey {
            key,
            source: KeySource::Imported,
        })
    }

    /// Drop every key held in memory. The persistent cache is left alone.
    pub fn forget_all(&self) {
        let mut held = self.held();
        if !held.is_empty() {
            debug!("Forgetting {} held conversation keys", held.len());
        }
        held.clear();
    }
}
