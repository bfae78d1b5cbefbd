//! AES-256-GCM envelope cipher
//!
//! Формат envelope: `iv (12) || tag (16) || ciphertext`.
//! Envelope самодостаточен и может передаваться как bytes или base64.

use crate::config::Config;
use crate::error::{CryptoError, Result};
use crate::utils::b64;
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::rngs::OsRng;
use rand_core::RngCore;
use zeroize::{Zeroize, Zeroizing};

pub const IV_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;
pub const KEY_LENGTH: usize = 32;

/// AAD домен для сообщений Double Ratchet
pub const MESSAGE_AAD: &[u8] = b"Construct-E2EE-Message-v1";
/// AAD домен для ключей, завёрнутых мастер-ключом хранилища
pub const VAULT_WRAP_AAD: &[u8] = b"Construct-E2EE-Vault-Wrap-v1";

/// Зашифрованный envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub iv: [u8; IV_LENGTH],
    pub tag: [u8; TAG_LENGTH],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_LENGTH + TAG_LENGTH + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Разобрать envelope. Слишком короткий ввод считается ошибкой аутентификации.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IV_LENGTH + TAG_LENGTH {
            return Err(CryptoError::AuthenticationError);
        }
        let (iv, rest) = bytes.split_at(IV_LENGTH);
        let (tag, ciphertext) = rest.split_at(TAG_LENGTH);

        let mut envelope = Envelope {
            iv: [0u8; IV_LENGTH],
            tag: [0u8; TAG_LENGTH],
            ciphertext: ciphertext.to_vec(),
        };
        envelope.iv.copy_from_slice(iv);
        envelope.tag.copy_from_slice(tag);
        Ok(envelope)
    }

    pub fn to_base64(&self) -> String {
        b64::encode(&self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = b64::decode(encoded).map_err(|_| CryptoError::AuthenticationError)?;
        Self::from_bytes(&bytes)
    }

    pub fn len(&self) -> usize {
        IV_LENGTH + TAG_LENGTH + self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

/// Authenticated symmetric cipher (AES-256-GCM)
#[derive(Debug, Clone)]
pub struct SymmetricCipher {
    max_plaintext_len: usize,
}

impl SymmetricCipher {
    pub fn new(config: &Config) -> Self {
        Self {
            max_plaintext_len: config.max_plaintext_len,
        }
    }

    pub fn max_plaintext_len(&self) -> usize {
        self.max_plaintext_len
    }

    /// Зашифровать plaintext со случайным 96-битным IV
    pub fn encrypt(&self, plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<Envelope> {
        if plaintext.len() > self.max_plaintext_len {
            return Err(CryptoError::PayloadTooLarge {
                size: plaintext.len(),
                limit: self.max_plaintext_len,
            });
        }
        let cipher = Self::cipher_for(key)?;

        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
            .map_err(|e| {
                buffer.zeroize();
                CryptoError::InternalError(format!("AEAD encryption failed: {}", e))
            })?;

        let mut tag_bytes = [0u8; TAG_LENGTH];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(Envelope {
            iv,
            tag: tag_bytes,
            ciphertext: buffer,
        })
    }

    /// Расшифровать envelope.
    ///
    /// При любой ошибке рабочий буфер обнуляется и наружу ничего не возвращается.
    pub fn decrypt(&self, envelope: &Envelope, key: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let cipher = Self::cipher_for(key)?;

        let mut buffer = Zeroizing::new(envelope.ciphertext.clone());
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&envelope.iv),
                aad,
                buffer.as_mut_slice(),
                Tag::from_slice(&envelope.tag),
            )
            .map_err(|_| CryptoError::AuthenticationError)?;

        Ok(buffer)
    }

    /// Расшифровать сырой envelope (`iv || tag || ciphertext`)
    pub fn decrypt_bytes(&self, envelope: &[u8], key: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let envelope = Envelope::from_bytes(envelope)?;
        self.decrypt(&envelope, key, aad)
    }

    fn cipher_for(key: &[u8]) -> Result<Aes256Gcm> {
        if key.len() != KEY_LENGTH {
            return Err(CryptoError::invalid_length(KEY_LENGTH, key.len()));
        }
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::invalid_length(KEY_LENGTH, key.len()))
    }
}

impl Default for SymmetricCipher {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = SymmetricCipher::default();
        for size in [0usize, 1, 15, 16, 17, 1024, 64 * 1024] {
            let plaintext: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let envelope = cipher.encrypt(&plaintext, &key(7), MESSAGE_AAD).unwrap();
            assert_eq!(envelope.ciphertext.len(), size);
            let decrypted = cipher.decrypt(&envelope, &key(7), MESSAGE_AAD).unwrap();
            assert_eq!(decrypted.as_slice(), plaintext.as_slice());
        }
    }

    #[test]
    fn test_envelope_layout() {
        let cipher = SymmetricCipher::default();
        let envelope = cipher.encrypt(b"hello", &key(1), MESSAGE_AAD).unwrap();
        let bytes = envelope.to_bytes();
        assert_eq!(bytes.len(), IV_LENGTH + TAG_LENGTH + 5);
        assert_eq!(&bytes[..IV_LENGTH], &envelope.iv);
        assert_eq!(&bytes[IV_LENGTH..IV_LENGTH + TAG_LENGTH], &envelope.tag);
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = SymmetricCipher::default();
        let envelope = cipher.encrypt(b"secret", &key(1), MESSAGE_AAD).unwrap();
        let result = cipher.decrypt(&envelope, &key(2), MESSAGE_AAD);
        assert_eq!(result.unwrap_err(), CryptoError::AuthenticationError);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let cipher = SymmetricCipher::default();
        let envelope = cipher.encrypt(b"secret", &key(1), MESSAGE_AAD).unwrap();
        let result = cipher.decrypt(&envelope, &key(1), VAULT_WRAP_AAD);
        assert_eq!(result.unwrap_err(), CryptoError::AuthenticationError);
    }

    #[test]
    fn test_every_tampered_byte_is_rejected() {
        let cipher = SymmetricCipher::default();
        let bytes = cipher
            .encrypt(b"attack at dawn", &key(3), MESSAGE_AAD)
            .unwrap()
            .to_bytes();

        for i in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x01;
            let result = cipher.decrypt_bytes(&tampered, &key(3), MESSAGE_AAD);
            assert_eq!(result.unwrap_err(), CryptoError::AuthenticationError, "byte {}", i);
        }
    }

    #[test]
    fn test_short_envelope_rejected() {
        let cipher = SymmetricCipher::default();
        let result = cipher.decrypt_bytes(&[0u8; 27], &key(3), MESSAGE_AAD);
        assert_eq!(result.unwrap_err(), CryptoError::AuthenticationError);
    }

    #[test]
    fn test_invalid_key_length() {
        let cipher = SymmetricCipher::default();
        let result = cipher.encrypt(b"data", &[0u8; 16], MESSAGE_AAD);
        assert_eq!(
            result.unwrap_err(),
            CryptoError::InvalidKeyLength { expected: 32, actual: 16 }
        );
    }

    #[test]
    fn test_payload_limit() {
        let config = Config {
            max_plaintext_len: 8,
            ..Config::default()
        };
        let cipher = SymmetricCipher::new(&config);
        assert!(cipher.encrypt(&[0u8; 8], &key(1), MESSAGE_AAD).is_ok());
        assert!(matches!(
            cipher.encrypt(&[0u8; 9], &key(1), MESSAGE_AAD),
            Err(CryptoError::PayloadTooLarge { size: 9, limit: 8 })
        ));
    }

    #[test]
    fn test_base64_roundtrip() {
        let cipher = SymmetricCipher::default();
        let envelope = cipher.encrypt(b"base64", &key(9), MESSAGE_AAD).unwrap();
        let encoded = envelope.to_base64();
        let decoded = Envelope::from_base64(&encoded).unwrap();
        assert_eq!(decoded, envelope);
        assert!(Envelope::from_base64("!!not base64!!").is_err());
    }

    #[test]
    fn test_iv_is_random() {
        let cipher = SymmetricCipher::default();
        let a = cipher.encrypt(b"same", &key(4), MESSAGE_AAD).unwrap();
        let b = cipher.encrypt(b"same", &key(4), MESSAGE_AAD).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
