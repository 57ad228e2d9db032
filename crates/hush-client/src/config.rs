use std::path::PathBuf;

use url::Url;

use crate::error::{CacheError, ConfigError};
use crate::key_cache::KeyCache;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

/// Client settings, read from `HUSH_*` environment variables.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_url: Url,
    pub access_token: String,
    /// `None` keeps the key cache in memory only.
    pub key_cache_path: Option<PathBuf>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let raw_url = get("HUSH_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let server_url = Url::parse(&raw_url).map_err(|e| ConfigError::Invalid {
            name: "HUSH_SERVER_URL",
            reason: e.to_string(),
        })?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                name: "HUSH_SERVER_URL",
                reason: format!("unsupported scheme {}", server_url.scheme()),
            });
        }

        let access_token = get("HUSH_ACCESS_TOKEN").ok_or(ConfigError::Missing("HUSH_ACCESS_TOKEN"))?;
        let key_cache_path = get("HUSH_KEY_CACHE_PATH").map(PathBuf::from);

        Ok(Self {
            server_url,
            access_token,
            key_cache_path,
        })
    }

    pub fn open_key_cache(&self) -> Result<KeyCache, CacheError> {
        match &self.key_cache_path {
            Some(path) => KeyCache::open(path),
            None => KeyCache::in_memory(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url.as_str())
            .field("access_token", &"<redacted>")
            .field("key_cache_path", &self.key_cache_path)
            .finish()
    }
}
