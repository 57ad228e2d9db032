use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use hush_crypto::PortableKey;

use crate::error::CacheError;

/// Local store of conversation id -> portable key.
///
/// Lives for one signed-in session: [`KeyCache::bind_owner`] on session
/// start, [`KeyCache::clear`] on logout. Never talks to the backend.
pub struct KeyCache {
    conn: Mutex<Connection>,
}

impl KeyCache {
    /// Open (or create) an on-disk cache.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let cache = Self::init(Connection::open(path)?)?;
        info!("Key cache opened at {}", path.display());
        Ok(cache)
    }

    /// A cache that disappears with the process.
    pub fn in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        // Deleted pages are overwritten with zeros
        conn.pragma_update(None, "secure_delete", "ON")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chat_keys (
                conversation_id TEXT PRIMARY KEY,
                portable_key    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cache_meta (
                name    TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn.lock().map_err(|_| CacheError::Poisoned)
    }

    pub fn get(&self, conversation_id: Uuid) -> Result<Option<PortableKey>, CacheError> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                "SELECT portable_key FROM chat_keys WHERE conversation_id = ?1",
                [conversation_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(key.map(PortableKey::from))
    }

    /// Insert or overwrite. Writing the same key twice is a no-op.
    pub fn put(&self, conversation_id: Uuid, key: &PortableKey) -> Result<(), CacheError> {
        self.conn()?.execute(
            "INSERT INTO chat_keys (conversation_id, portable_key) VALUES (?1, ?2)
             ON CONFLICT(conversation_id) DO UPDATE SET portable_key = excluded.portable_key",
            (conversation_id.to_string(), key.as_str()),
        )?;
        Ok(())
    }

    pub fn remove(&self, conversation_id: Uuid) -> Result<(), CacheError> {
        self.conn()?.execute(
            "DELETE FROM chat_keys WHERE conversation_id = ?1",
            [conversation_id.to_string()],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM chat_keys", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Drop every cached key and the owner binding, then compact the file so
    /// freed pages do not keep key material around.
    pub fn clear(&self) -> Result<(), CacheError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM chat_keys", [])?;
        conn.execute("DELETE FROM cache_meta", [])?;
        conn.execute_batch("VACUUM")?;
        info!("Key cache cleared ({} keys purged)", removed);
        Ok(())
    }

    /// Tie the cache to the signed-in account. Keys left behind by a
    /// different account are purged first.
    pub fn bind_owner(&self, user_id: Uuid) -> Result<(), CacheError> {
        let owner: Option<String> = self
            .conn()?
            .query_row("SELECT value FROM cache_meta WHERE name = 'owner'", [], |row| {
                row.get(0)
            })
            .optional()?;

        let user = user_id.to_string();
        match owner {
            Some(ref current) if *current == user => {
                debug!("Key cache already bound to {}", user_id);
                return Ok(());
            }
            Some(previous) => {
                info!("Key cache belonged to {}, clearing for {}", previous, user_id);
                self.clear()?;
            }
            None => {}
        }

        self.conn()?.execute(
            "INSERT INTO cache_meta (name, value) VALUES ('owner', ?1)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            [user],
        )?;
        Ok(())
    }
}
