use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use zeroize::Zeroize;

use crate::error::{DecryptionError, EncryptionError};
use crate::keys::ChatKey;

/// AES-GCM nonce length (96 bits).
pub const IV_LEN: usize = 12;

/// Authentication tag appended to every ciphertext (128 bits).
pub const TAG_LEN: usize = 16;

/// Encrypt a message body with AES-256-GCM under a fresh random IV.
/// Returns (ciphertext || tag, iv).
pub fn encrypt_message(key: &ChatKey, plaintext: &str) -> Result<(Vec<u8>, Vec<u8>), EncryptionError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| EncryptionError::Cipher)?;

    Ok((ciphertext, iv.to_vec()))
}

/// Decrypt and authenticate a message body.
///
/// Fails closed: a wrong key, any modified byte of ciphertext or IV, or a
/// truncated input yields an error and no plaintext.
pub fn decrypt_message(key: &ChatKey, ciphertext: &[u8], iv: &[u8]) -> Result<String, DecryptionError> {
    if iv.len() != IV_LEN {
        return Err(DecryptionError::IvLength(iv.len()));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(iv);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| DecryptionError::Authentication)?;

    String::from_utf8(plaintext).map_err(|e| {
        e.into_bytes().zeroize();
        DecryptionError::InvalidUtf8
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use proptest::prelude::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = ChatKey::generate();
        let message = "Hello from Hush!";

        let (ciphertext, iv) = encrypt_message(&key, message).unwrap();
        assert_ne!(&ciphertext[..], message.as_bytes());
        assert_eq!(ciphertext.len(), message.len() + TAG_LEN);
        assert_eq!(iv.len(), IV_LEN);

        let decrypted = decrypt_message(&key, &ciphertext, &iv).unwrap();
        assert_eq!(decrypted, message);
    }

    #[test]
    fn empty_and_unicode_roundtrip() {
        let key = ChatKey::generate();
        for text in ["", "héllo wörld", "日本語のテキスト", "🔐🗝️ emoji", "\0nul\n"] {
            let (ciphertext, iv) = encrypt_message(&key, text).unwrap();
            assert_eq!(decrypt_message(&key, &ciphertext, &iv).unwrap(), text);
        }
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = ChatKey::generate();
        let key2 = ChatKey::generate();

        let (ciphertext, iv) = encrypt_message(&key1, "Secret message").unwrap();
        assert_eq!(
            decrypt_message(&key2, &ciphertext, &iv),
            Err(DecryptionError::Authentication)
        );
    }

    #[test]
    fn every_iv_is_fresh() {
        let key = ChatKey::generate();
        let (c1, iv1) = encrypt_message(&key, "same").unwrap();
        let (c2, iv2) = encrypt_message(&key, "same").unwrap();
        assert_ne!(iv1, iv2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn decryption_is_deterministic() {
        let key = ChatKey::generate();
        let (ciphertext, iv) = encrypt_message(&key, "stable").unwrap();
        assert_eq!(
            decrypt_message(&key, &ciphertext, &iv),
            decrypt_message(&key, &ciphertext, &iv)
        );

        let mut bad = ciphertext.clone();
        bad[0] ^= 1;
        assert_eq!(
            decrypt_message(&key, &bad, &iv),
            decrypt_message(&key, &bad, &iv)
        );
    }

    #[test]
    fn flipping_any_ciphertext_byte_fails() {
        let key = ChatKey::generate();
        let (ciphertext, iv) = encrypt_message(&key, "tamper with me").unwrap();

        for i in 0..ciphertext.len() {
            let mut tampered = ciphertext.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                decrypt_message(&key, &tampered, &iv),
                Err(DecryptionError::Authentication),
                "byte {} of ciphertext",
                i
            );
        }
    }

    #[test]
    fn flipping_any_iv_byte_fails() {
        let key = ChatKey::generate();
        let (ciphertext, iv) = encrypt_message(&key, "tamper with me").unwrap();

        for i in 0..iv.len() {
            let mut tampered = iv.clone();
            tampered[i] ^= 0x80;
            assert_eq!(
                decrypt_message(&key, &ciphertext, &tampered),
                Err(DecryptionError::Authentication),
                "byte {} of iv",
                i
            );
        }
    }

    #[test]
    fn truncated_inputs_fail() {
        let key = ChatKey::generate();
        let (ciphertext, iv) = encrypt_message(&key, "truncate").unwrap();

        assert_eq!(
            decrypt_message(&key, &ciphertext[..ciphertext.len() - 1], &iv),
            Err(DecryptionError::Authentication)
        );
        assert_eq!(
            decrypt_message(&key, &ciphertext[..TAG_LEN - 1], &iv),
            Err(DecryptionError::Authentication)
        );
        assert_eq!(
            decrypt_message(&key, &[], &iv),
            Err(DecryptionError::Authentication)
        );
        assert_eq!(
            decrypt_message(&key, &ciphertext, &iv[..IV_LEN - 1]),
            Err(DecryptionError::IvLength(IV_LEN - 1))
        );
        assert_eq!(
            decrypt_message(&key, &ciphertext, &[]),
            Err(DecryptionError::IvLength(0))
        );
    }

    #[test]
    fn imported_key_decrypts_exported_keys_messages() {
        let (key, portable) = keys::generate();
        let (ciphertext, iv) = encrypt_message(&key, "via the portable form").unwrap();

        let imported = keys::import(&portable).unwrap();
        assert_eq!(
            decrypt_message(&imported, &ciphertext, &iv).unwrap(),
            "via the portable form"
        );
    }

    proptest! {
        #[test]
        fn roundtrip_any_text(text in any::<String>()) {
            let key = ChatKey::generate();
            let (ciphertext, iv) = encrypt_message(&key, &text).unwrap();
            prop_assert_eq!(decrypt_message(&key, &ciphertext, &iv).unwrap(), text);
        }

        #[test]
        fn other_key_never_decrypts(text in any::<String>()) {
            let (k1, k2) = (ChatKey::generate(), ChatKey::generate());
            let (ciphertext, iv) = encrypt_message(&k1, &text).unwrap();
            prop_assert_eq!(
                decrypt_message(&k2, &ciphertext, &iv),
                Err(DecryptionError::Authentication)
            );
        }

        #[test]
        fn import_export_roundtrip(bytes in any::<[u8; 32]>()) {
            let key = ChatKey::from_bytes(bytes);
            prop_assert_eq!(keys::import(&keys::export(&key)).unwrap(), key);
        }
    }
}
