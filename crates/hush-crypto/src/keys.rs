use std::fmt;

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::KeyImportError;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Raw conversation key. Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChatKey([u8; KEY_LEN]);

impl ChatKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Generate a random 256-bit key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }
}

impl fmt::Debug for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChatKey(..)")
    }
}

/// Base64 text form of a [`ChatKey`], as stored on the conversation record
/// and in the local key cache. Sensitive: wiped on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PortableKey(String);

impl PortableKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PortableKey {
    fn from(encoded: String) -> Self {
        Self(encoded)
    }
}

impl From<&str> for PortableKey {
    fn from(encoded: &str) -> Self {
        Self(encoded.to_string())
    }
}

impl fmt::Debug for PortableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PortableKey(..)")
    }
}

/// Generate a fresh conversation key together with its portable form.
pub fn generate() -> (ChatKey, PortableKey) {
    let key = ChatKey::generate();
    let portable = export(&key);
    (key, portable)
}

/// Encode a key to base64 for storage.
pub fn export(key: &ChatKey) -> PortableKey {
    PortableKey(BASE64.encode(key.as_bytes()))
}

/// Decode a base64 key.
pub fn import(portable: &PortableKey) -> Result<ChatKey, KeyImportError> {
    let bytes = Zeroizing::new(BASE64.decode(portable.as_str())?);
    let key: [u8; KEY_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyImportError::Length(bytes.len()))?;
    Ok(ChatKey(key))
}
