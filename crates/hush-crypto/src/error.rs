use thiserror::Error;

/// A portable key could not be turned back into a usable key.
/// The conversation record holding it is treated as corrupted.
#[derive(Debug, Error)]
pub enum KeyImportError {
    #[error("portable key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("portable key decodes to {0} bytes, expected 32")]
    Length(usize),
}

/// Authentication or integrity failure for a single message.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("iv must be 12 bytes, got {0}")]
    IvLength(usize),

    #[error("authentication failed (wrong key or tampered message)")]
    Authentication,

    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("AES-GCM encryption failed")]
    Cipher,
}
