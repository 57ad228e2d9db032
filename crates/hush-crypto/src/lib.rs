/// Hush Crypto Library
///
/// One AES-256-GCM key per two-party conversation. The key is generated by
/// whoever starts the conversation, stored once as a portable (base64) blob
/// on the conversation record, and never rotated.
///
/// - `keys`: generation, export and import of conversation keys
/// - `encrypt`: authenticated encryption of message bodies
pub mod encrypt;
pub mod error;
pub mod keys;

pub use encrypt::{IV_LEN, TAG_LEN, decrypt_message, encrypt_message};
pub use error::{DecryptionError, EncryptionError, KeyImportError};
pub use keys::{ChatKey, KEY_LEN, PortableKey};
