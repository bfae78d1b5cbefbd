// Управление долгосрочными ключами
// Identity key, signed prekey (с ротацией) и one-time prekeys

use crate::config::Config;
use crate::crypto::handshake::x3dh::{OneTimePrekeyPublic, PrekeyBundle, X3DHProtocol};
use crate::crypto::kem::{ClassicalKeyPair, HybridKeyPair, KeyEncapsulationService};
use crate::error::{CryptoError, Result};
use crate::utils::time::{current_timestamp, is_expired};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::collections::{BTreeMap, HashMap};

/// Долгосрочная identity пара: X25519 для DH + Ed25519 для подписей
#[derive(Clone)]
pub struct IdentityKeyPair {
    pub dh: ClassicalKeyPair,
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            dh: ClassicalKeyPair::generate(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Восстановить из сохранённых секретов
    pub fn from_secret_bytes(dh_secret: [u8; 32], signing_secret: [u8; 32]) -> Self {
        Self {
            dh: ClassicalKeyPair::from_secret_bytes(dh_secret),
            signing_key: SigningKey::from_bytes(&signing_secret),
        }
    }

    pub fn dh_public(&self) -> [u8; 32] {
        self.dh.public.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("dh_public", &self.dh.public.as_bytes())
            .field("verifying_key", &self.verifying_key().as_bytes())
            .finish()
    }
}

/// Signed prekey с метаданными
#[derive(Debug, Clone)]
pub struct SignedPrekey {
    pub key_id: u32,
    pub keypair: HybridKeyPair,
    pub signature: Vec<u8>,
    pub created_at: i64,
}

/// One-time prekey. Приватная часть живёт только до первого использования.
#[derive(Debug)]
struct OneTimePrekey {
    keypair: ClassicalKeyPair,
    created_at: i64,
    published: bool,
}

/// Хранилище identity ключа и prekeys одного устройства
pub struct IdentityAndPrekeyStore {
    /// Identity ключ (долговременный)
    identity: IdentityKeyPair,

    /// Текущий signed prekey
    current_signed_prekey: SignedPrekey,

    /// Предыдущие signed prekeys (ещё могут прийти handshakes под ними)
    old_signed_prekeys: HashMap<u32, SignedPrekey>,

    /// One-time prekeys по id
    one_time_prekeys: BTreeMap<u32, OneTimePrekey>,

    next_signed_prekey_id: u32,
    next_one_time_prekey_id: u32,

    one_time_prekey_ttl_secs: i64,
    signed_prekey_grace_secs: i64,
}

impl IdentityAndPrekeyStore {
    /// Создать хранилище с новыми ключами
    pub fn new(kem: &KeyEncapsulationService, config: &Config) -> Self {
        Self::with_identity(IdentityKeyPair::generate(), kem, config)
    }

    /// Создать хранилище для существующего identity ключа
    pub fn with_identity(
        identity: IdentityKeyPair,
        kem: &KeyEncapsulationService,
        config: &Config,
    ) -> Self {
        let current_signed_prekey = Self::make_signed_prekey(&identity, kem, 1);
        Self {
            identity,
            current_signed_prekey,
            old_signed_prekeys: HashMap::new(),
            one_time_prekeys: BTreeMap::new(),
            next_signed_prekey_id: 2,
            next_one_time_prekey_id: 1,
            one_time_prekey_ttl_secs: config.one_time_prekey_ttl_secs,
            signed_prekey_grace_secs: config.signed_prekey_grace_secs,
        }
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn current_signed_prekey(&self) -> &SignedPrekey {
        &self.current_signed_prekey
    }

    /// Получить signed prekey по ID (текущий или из истории)
    pub fn signed_prekey(&self, key_id: u32) -> Result<&SignedPrekey> {
        if self.current_signed_prekey.key_id == key_id {
            return Ok(&self.current_signed_prekey);
        }
        self.old_signed_prekeys
            .get(&key_id)
            .ok_or_else(|| CryptoError::KeyNotFoundError(format!("signed prekey {}", key_id)))
    }

    /// Ротация signed prekey
    pub fn rotate_signed_prekey(&mut self, kem: &KeyEncapsulationService) -> u32 {
        let key_id = self.next_signed_prekey_id;
        self.next_signed_prekey_id += 1;

        let new_prekey = Self::make_signed_prekey(&self.identity, kem, key_id);
        let old_prekey = std::mem::replace(&mut self.current_signed_prekey, new_prekey);

        // Сохраняем старый prekey в историю
        self.old_signed_prekeys.insert(old_prekey.key_id, old_prekey);

        tracing::debug!(target: "crypto::keys", key_id, "Rotated signed prekey");
        key_id
    }

    /// Сгенерировать `count` новых one-time prekeys
    pub fn generate_one_time_prekeys(&mut self, count: usize) -> Vec<u32> {
        let now = current_timestamp();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let key_id = self.next_one_time_prekey_id;
            self.next_one_time_prekey_id += 1;
            self.one_time_prekeys.insert(
                key_id,
                OneTimePrekey {
                    keypair: ClassicalKeyPair::generate(),
                    created_at: now,
                    published: false,
                },
            );
            ids.push(key_id);
        }
        ids
    }

    /// Опубликовать bundle: подписанный prekey + следующий неопубликованный one-time prekey
    pub fn publish_bundle(&mut self, device_id: &str) -> PrekeyBundle {
        let one_time_prekey = self
            .one_time_prekeys
            .iter_mut()
            .find(|(_, prekey)| !prekey.published)
            .map(|(key_id, prekey)| {
                prekey.published = true;
                OneTimePrekeyPublic {
                    key_id: *key_id,
                    public: prekey.keypair.public.to_bytes(),
                }
            });

        let signed = &self.current_signed_prekey;
        let signed_prekey = signed.keypair.public_key();

        tracing::debug!(
            target: "crypto::keys",
            device_id,
            signed_prekey_id = signed.key_id,
            one_time_prekey = one_time_prekey.as_ref().map(|p| p.key_id),
            hybrid = signed_prekey.is_hybrid(),
            "Publishing prekey bundle"
        );

        PrekeyBundle {
            identity_key: self.identity.dh_public(),
            verifying_key: self.identity.verifying_key().to_bytes(),
            signed_prekey_id: signed.key_id,
            signed_prekey,
            signed_prekey_signature: signed.signature.clone(),
            one_time_prekey,
            device_id: device_id.to_string(),
            suite_id: signed.keypair.suite_id(),
        }
    }

    /// Забрать one-time prekey. Приватная часть удаляется из хранилища навсегда.
    pub fn consume_one_time_prekey(&mut self, key_id: u32) -> Result<ClassicalKeyPair> {
        match self.one_time_prekeys.remove(&key_id) {
            Some(prekey) => {
                tracing::debug!(target: "crypto::keys", key_id, "Consumed one-time prekey");
                Ok(prekey.keypair)
            }
            None => Err(CryptoError::PrekeyExhaustedError(key_id)),
        }
    }

    pub fn one_time_prekey_count(&self) -> usize {
        self.one_time_prekeys.len()
    }

    pub fn old_signed_prekeys_count(&self) -> usize {
        self.old_signed_prekeys.len()
    }

    /// Удалить просроченные one-time prekeys и старые signed prekeys
    ///
    /// Возвращает количество удалённых ключей.
    pub fn sweep_expired(&mut self, now: i64) -> usize {
        let before = self.one_time_prekeys.len() + self.old_signed_prekeys.len();

        let one_time_ttl = self.one_time_prekey_ttl_secs;
        self.one_time_prekeys
            .retain(|_, prekey| !is_expired(prekey.created_at, now, one_time_ttl));

        let grace = self.signed_prekey_grace_secs;
        self.old_signed_prekeys
            .retain(|_, prekey| !is_expired(prekey.created_at, now, grace));

        let removed = before - (self.one_time_prekeys.len() + self.old_signed_prekeys.len());
        if removed > 0 {
            tracing::debug!(target: "crypto::keys", removed, "Swept expired prekeys");
        }
        removed
    }

    fn make_signed_prekey(
        identity: &IdentityKeyPair,
        kem: &KeyEncapsulationService,
        key_id: u32,
    ) -> SignedPrekey {
        let keypair = kem.generate_keypair();
        let signature = X3DHProtocol::sign_prekey(identity, key_id, &keypair.public_key());
        SignedPrekey {
            key_id,
            keypair,
            signature,
            created_at: current_timestamp(),
        }
    }
}
