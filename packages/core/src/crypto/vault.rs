// Локальное хранилище ключей
// Все ключи завёрнуты (AES-256-GCM) мастер-ключом, который живёт только в памяти процесса

use crate::config::Config;
use crate::crypto::cipher::{Envelope, SymmetricCipher, KEY_LENGTH, VAULT_WRAP_AAD};
use crate::error::{CryptoError, Result};
use crate::utils::time::{current_timestamp, is_expired};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Тип ключа в хранилище
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// 32 случайных байта (AES-256 / HKDF input)
    Symmetric,
    /// X25519 private key
    X25519,
    /// Ed25519 signing key (seed)
    Ed25519,
}

impl KeyType {
    fn tag(self) -> u8 {
        match self {
            KeyType::Symmetric => 1,
            KeyType::X25519 => 2,
            KeyType::Ed25519 => 3,
        }
    }
}

/// Запись хранилища: ключ только в завёрнутом виде
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    pub key_id: String,
    #[serde(with = "serde_bytes")]
    pub wrapped_key: Vec<u8>,
    pub key_type: KeyType,
    /// Публичная часть для асимметричных ключей
    pub public_key: Option<[u8; 32]>,
    pub created_at: i64,
    pub last_used: i64,
}

struct VaultInner {
    master_key: Zeroizing<[u8; KEY_LENGTH]>,
    entries: HashMap<String, VaultEntry>,
}

/// Хранилище ключей с мастер-ключом процесса
pub struct SecureKeyVault {
    inner: Mutex<VaultInner>,
    cipher: SymmetricCipher,
    key_ttl_secs: i64,
}

impl SecureKeyVault {
    pub fn new(config: &Config) -> Self {
        let mut master_key = Zeroizing::new([0u8; KEY_LENGTH]);
        OsRng.fill_bytes(&mut master_key[..]);

        Self {
            inner: Mutex::new(VaultInner {
                master_key,
                entries: HashMap::new(),
            }),
            cipher: SymmetricCipher::new(config),
            key_ttl_secs: config.vault_key_ttl_secs,
        }
    }

    /// Сгенерировать и сохранить новый ключ. Пустой `key_id` заменяется UUID.
    pub fn generate_key(&self, key_id: &str, key_type: KeyType) -> Result<String> {
        let (secret, public_key) = generate_secret(key_type);
        self.insert_secret(key_id, key_type, &secret, public_key)
    }

    /// Сохранить существующий секрет (например, identity key)
    pub fn store_key(&self, key_id: &str, key_type: KeyType, secret: &[u8]) -> Result<String> {
        let public_key = derive_public(key_type, secret)?;
        self.insert_secret(key_id, key_type, secret, public_key)
    }

    /// Развернуть ключ. Обновляет `last_used`.
    pub fn get_key(&self, key_id: &str) -> Result<Zeroizing<Vec<u8>>> {
        let mut inner = self.inner.lock()?;
        let VaultInner {
            master_key,
            entries,
        } = &mut *inner;

        let entry = entries
            .get_mut(key_id)
            .ok_or_else(|| CryptoError::KeyNotFoundError(key_id.to_string()))?;

        let secret = self.unwrap_entry(entry, master_key)?;
        entry.last_used = current_timestamp();

        tracing::trace!(target: "crypto::vault", key_id, key_type = ?entry.key_type, "Key unwrapped");
        Ok(secret)
    }

    pub fn public_key(&self, key_id: &str) -> Result<Option<[u8; 32]>> {
        let inner = self.inner.lock()?;
        inner
            .entries
            .get(key_id)
            .map(|entry| entry.public_key)
            .ok_or_else(|| CryptoError::KeyNotFoundError(key_id.to_string()))
    }

    pub fn delete_key(&self, key_id: &str) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner
            .entries
            .remove(key_id)
            .ok_or_else(|| CryptoError::KeyNotFoundError(key_id.to_string()))?;
        tracing::debug!(target: "crypto::vault", key_id, "Key deleted");
        Ok(())
    }

    pub fn contains(&self, key_id: &str) -> Result<bool> {
        Ok(self.inner.lock()?.entries.contains_key(key_id))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.lock()?.entries.len())
    }

    /// Удалить ключи, не использованные дольше `vault_key_ttl_secs`
    pub fn sweep_expired(&self, now: i64) -> Result<usize> {
        let mut inner = self.inner.lock()?;
        let before = inner.entries.len();
        let ttl = self.key_ttl_secs;
        inner
            .entries
            .retain(|_, entry| !is_expired(entry.last_used, now, ttl));
        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::debug!(target: "crypto::vault", removed, "Swept idle vault keys");
        }
        Ok(removed)
    }

    /// Выгрузить запись (только завёрнутый ключ) для внешнего хранения
    pub fn export_entry(&self, key_id: &str) -> Result<VaultEntry> {
        let inner = self.inner.lock()?;
        inner
            .entries
            .get(key_id)
            .cloned()
            .ok_or_else(|| CryptoError::KeyNotFoundError(key_id.to_string()))
    }

    /// Загрузить ранее выгруженную запись.
    ///
    /// Запись, завёрнутая другим мастер-ключом, принимается, но `get_key`
    /// для неё вернёт `VaultMasterKeyError`.
    pub fn import_entry(&self, entry: VaultEntry) -> Result<()> {
        if entry.key_id.is_empty() {
            return Err(CryptoError::InvalidInputError("Empty key id".to_string()));
        }
        let mut inner = self.inner.lock()?;
        tracing::debug!(target: "crypto::vault", key_id = %entry.key_id, "Entry imported");
        inner.entries.insert(entry.key_id.clone(), entry);
        Ok(())
    }

    fn insert_secret(
        &self,
        key_id: &str,
        key_type: KeyType,
        secret: &[u8],
        public_key: Option<[u8; 32]>,
    ) -> Result<String> {
        let key_id = if key_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            key_id.to_string()
        };

        let mut inner = self.inner.lock()?;
        if inner.entries.contains_key(&key_id) {
            return Err(CryptoError::InvalidInputError(format!(
                "Key {} already exists",
                key_id
            )));
        }

        let aad = wrap_aad(&key_id, key_type);
        let wrapped = self.cipher.encrypt(secret, &inner.master_key[..], &aad)?;

        let now = current_timestamp();
        inner.entries.insert(
            key_id.clone(),
            VaultEntry {
                key_id: key_id.clone(),
                wrapped_key: wrapped.to_bytes(),
                key_type,
                public_key,
                created_at: now,
                last_used: now,
            },
        );

        tracing::debug!(target: "crypto::vault", key_id = %key_id, ?key_type, "Key stored");
        Ok(key_id)
    }

    fn unwrap_entry(
        &self,
        entry: &VaultEntry,
        master_key: &[u8; KEY_LENGTH],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let aad = wrap_aad(&entry.key_id, entry.key_type);
        let unwrap_failed = |_| {
            tracing::warn!(target: "crypto::vault", key_id = %entry.key_id, "Failed to unwrap key");
            CryptoError::VaultMasterKeyError(format!("cannot unwrap key {}", entry.key_id))
        };

        let envelope = Envelope::from_bytes(&entry.wrapped_key).map_err(unwrap_failed)?;
        self.cipher
            .decrypt(&envelope, &master_key[..], &aad)
            .map_err(unwrap_failed)
    }
}

impl std::fmt::Debug for SecureKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureKeyVault")
            .field("key_ttl_secs", &self.key_ttl_secs)
            .finish_non_exhaustive()
    }
}

fn wrap_aad(key_id: &str, key_type: KeyType) -> Vec<u8> {
    let mut aad = Vec::with_capacity(VAULT_WRAP_AAD.len() + key_id.len() + 1);
    aad.extend_from_slice(VAULT_WRAP_AAD);
    aad.extend_from_slice(key_id.as_bytes());
    aad.push(key_type.tag());
    aad
}

fn generate_secret(key_type: KeyType) -> (Zeroizing<Vec<u8>>, Option<[u8; 32]>) {
    match key_type {
        KeyType::Symmetric => {
            let mut secret = Zeroizing::new(vec![0u8; KEY_LENGTH]);
            OsRng.fill_bytes(&mut secret[..]);
            (secret, None)
        }
        KeyType::X25519 => {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret).to_bytes();
            (Zeroizing::new(secret.to_bytes().to_vec()), Some(public))
        }
        KeyType::Ed25519 => {
            let signing = SigningKey::generate(&mut OsRng);
            let public = signing.verifying_key().to_bytes();
            (Zeroizing::new(signing.to_bytes().to_vec()), Some(public))
        }
    }
}

fn derive_public(key_type: KeyType, secret: &[u8]) -> Result<Option<[u8; 32]>> {
    if secret.len() != KEY_LENGTH {
        return Err(CryptoError::invalid_length(KEY_LENGTH, secret.len()));
    }
    let mut bytes = Zeroizing::new([0u8; 32]);
    bytes.copy_from_slice(secret);

    Ok(match key_type {
        KeyType::Symmetric => None,
        KeyType::X25519 => Some(PublicKey::from(&StaticSecret::from(*bytes)).to_bytes()),
        KeyType::Ed25519 => Some(SigningKey::from_bytes(&bytes).verifying_key().to_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> SecureKeyVault {
        SecureKeyVault::new(&Config::default())
    }

    #[test]
    fn test_generate_get_delete() {
        let vault = vault();
        let key_id = vault.generate_key("k1", KeyType::Symmetric).unwrap();
        assert_eq!(key_id, "k1");

        let first = vault.get_key("k1").unwrap();
        let second = vault.get_key("k1").unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(first.as_slice(), second.as_slice());

        vault.delete_key("k1").unwrap();
        assert_eq!(
            vault.get_key("k1").unwrap_err(),
            CryptoError::KeyNotFoundError("k1".to_string())
        );
        assert!(vault.delete_key("k1").is_err());
    }

    #[test]
    fn test_wrapped_blob_is_not_plaintext() {
        let vault = vault();
        vault.generate_key("k", KeyType::Symmetric).unwrap();
        let secret = vault.get_key("k").unwrap();
        let entry = vault.export_entry("k").unwrap();
        assert!(!entry
            .wrapped_key
            .windows(secret.len())
            .any(|window| window == secret.as_slice()));
    }

    #[test]
    fn test_asymmetric_public_keys() {
        let vault = vault();
        vault.generate_key("dh", KeyType::X25519).unwrap();
        vault.generate_key("sig", KeyType::Ed25519).unwrap();

        let dh_secret = vault.get_key("dh").unwrap();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&dh_secret);
        let expected = PublicKey::from(&StaticSecret::from(bytes)).to_bytes();
        assert_eq!(vault.public_key("dh").unwrap(), Some(expected));

        let sig_secret = vault.get_key("sig").unwrap();
        bytes.copy_from_slice(&sig_secret);
        let expected = SigningKey::from_bytes(&bytes).verifying_key().to_bytes();
        assert_eq!(vault.public_key("sig").unwrap(), Some(expected));
    }

    #[test]
    fn test_store_existing_key() {
        let vault = vault();
        let secret = [5u8; 32];
        vault.store_key("identity", KeyType::X25519, &secret).unwrap();
        assert_eq!(vault.get_key("identity").unwrap().as_slice(), &secret);
        assert!(vault.store_key("short", KeyType::X25519, &[1u8; 8]).is_err());
    }

    #[test]
    fn test_duplicate_and_generated_ids() {
        let vault = vault();
        vault.generate_key("same", KeyType::Symmetric).unwrap();
        assert!(matches!(
            vault.generate_key("same", KeyType::Symmetric),
            Err(CryptoError::InvalidInputError(_))
        ));
        let generated = vault.generate_key("", KeyType::Symmetric).unwrap();
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
        assert_eq!(vault.len().unwrap(), 2);
    }

    #[test]
    fn test_foreign_master_key_is_fatal() {
        let vault_a = vault();
        let vault_b = vault();
        vault_a.generate_key("k", KeyType::Symmetric).unwrap();

        vault_b.import_entry(vault_a.export_entry("k").unwrap()).unwrap();
        let err = vault_b.get_key("k").unwrap_err();
        assert!(matches!(err, CryptoError::VaultMasterKeyError(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_corrupted_entry() {
        let vault = vault();
        vault.generate_key("k", KeyType::Symmetric).unwrap();
        let mut entry = vault.export_entry("k").unwrap();
        let last = entry.wrapped_key.len() - 1;
        entry.wrapped_key[last] ^= 0xFF;
        vault.delete_key("k").unwrap();
        vault.import_entry(entry).unwrap();
        assert!(matches!(
            vault.get_key("k"),
            Err(CryptoError::VaultMasterKeyError(_))
        ));
    }

    #[test]
    fn test_entry_bound_to_key_type() {
        let vault = vault();
        vault.generate_key("k", KeyType::Symmetric).unwrap();
        let mut entry = vault.export_entry("k").unwrap();
        entry.key_type = KeyType::X25519;
        vault.delete_key("k").unwrap();
        vault.import_entry(entry).unwrap();
        assert!(vault.get_key("k").is_err());
    }

    #[test]
    fn test_sweep_expired() {
        let config = Config::default();
        let vault = SecureKeyVault::new(&config);
        vault.generate_key("k", KeyType::Symmetric).unwrap();
        let now = current_timestamp();
        assert_eq!(vault.sweep_expired(now).unwrap(), 0);
        assert_eq!(vault.sweep_expired(now + config.vault_key_ttl_secs + 1).unwrap(), 1);
        assert!(!vault.contains("k").unwrap());
    }
}
