// Crypto context: все сервисы ядра, собранные из одного Config
//
// Создаётся один раз на процесс (или на аккаунт) и передаётся по ссылке.

use crate::config::Config;
use crate::crypto::cipher::SymmetricCipher;
use crate::crypto::client_api::SessionManager;
use crate::crypto::handshake::{InitialHandshake, PrekeyBundle, X3DHProtocol};
use crate::crypto::kem::KeyEncapsulationService;
use crate::crypto::keys::IdentityAndPrekeyStore;
use crate::crypto::messaging::RatchetMessage;
use crate::crypto::sender_keys::GroupSenderKeyManager;
use crate::crypto::session_api::SecureSession;
use crate::crypto::vault::SecureKeyVault;
use crate::error::{CryptoError, Result};
use std::sync::{Arc, Mutex};
use tracing::info;
use zeroize::Zeroizing;

/// Итоги периодической очистки
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub prekeys: usize,
    pub vault_keys: usize,
    pub sessions: usize,
    pub skipped_keys: usize,
}

pub struct CryptoContext {
    config: Arc<Config>,
    kem: KeyEncapsulationService,
    cipher: SymmetricCipher,
    vault: SecureKeyVault,
    prekeys: Mutex<IdentityAndPrekeyStore>,
    sessions: SessionManager,
    sender_keys: GroupSenderKeyManager,
}

impl CryptoContext {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let kem = KeyEncapsulationService::new();
        let prekeys = IdentityAndPrekeyStore::new(&kem, &config);

        info!(
            target: "crypto::context",
            quantum_resistant = kem.is_quantum_resistant(),
            max_skipped_messages = config.max_skipped_messages,
            "Crypto context created"
        );

        Self {
            cipher: SymmetricCipher::new(&config),
            vault: SecureKeyVault::new(&config),
            prekeys: Mutex::new(prekeys),
            sessions: SessionManager::new(config.clone()),
            sender_keys: GroupSenderKeyManager::new(),
            kem,
            config,
        }
    }

    /// Контекст с конфигурацией из переменных окружения
    pub fn from_env() -> Self {
        Self::new(Config::from_env())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn kem(&self) -> &KeyEncapsulationService {
        &self.kem
    }

    pub fn cipher(&self) -> &SymmetricCipher {
        &self.cipher
    }

    pub fn vault(&self) -> &SecureKeyVault {
        &self.vault
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn sender_keys(&self) -> &GroupSenderKeyManager {
        &self.sender_keys
    }

    /// Публичный X25519 identity key
    pub fn identity_public(&self) -> Result<[u8; 32]> {
        Ok(self.prekeys.lock()?.identity().dh_public())
    }

    pub fn generate_one_time_prekeys(&self, count: usize) -> Result<Vec<u32>> {
        Ok(self.prekeys.lock()?.generate_one_time_prekeys(count))
    }

    pub fn rotate_signed_prekey(&self) -> Result<u32> {
        Ok(self.prekeys.lock()?.rotate_signed_prekey(&self.kem))
    }

    /// Bundle для публикации на сервере
    pub fn publish_bundle(&self, device_id: &str) -> Result<PrekeyBundle> {
        Ok(self.prekeys.lock()?.publish_bundle(device_id))
    }

    /// Начать сессию по bundle собеседника.
    ///
    /// Возвращённый handshake нужно доставить собеседнику вместе с первым сообщением.
    pub fn init_session(
        &self,
        local_id: &str,
        contact_id: &str,
        remote_bundle: &PrekeyBundle,
    ) -> Result<(String, InitialHandshake)> {
        let protocol = X3DHProtocol::new(&self.kem);
        let session = {
            let prekeys = self.prekeys.lock()?;
            SecureSession::init_as_initiator(
                &protocol,
                prekeys.identity(),
                local_id,
                contact_id,
                remote_bundle,
                &self.config,
            )?
        };

        let handshake = session.pending_handshake().cloned().ok_or_else(|| {
            CryptoError::InternalError("Initiator session without handshake".to_string())
        })?;
        let session_id = self.sessions.insert(session)?;
        Ok((session_id, handshake))
    }

    /// Принять сессию по handshake инициатора
    pub fn accept_session(
        &self,
        local_id: &str,
        contact_id: &str,
        handshake: &InitialHandshake,
    ) -> Result<String> {
        let protocol = X3DHProtocol::new(&self.kem);
        let session = {
            let mut prekeys = self.prekeys.lock()?;
            SecureSession::init_as_responder(
                &protocol,
                &mut *prekeys,
                local_id,
                contact_id,
                handshake,
                &self.config,
            )?
        };
        self.sessions.insert(session)
    }

    pub fn encrypt(&self, session_id: &str, plaintext: &[u8]) -> Result<RatchetMessage> {
        self.sessions.encrypt(session_id, plaintext)
    }

    pub fn decrypt(&self, session_id: &str, message: &RatchetMessage) -> Result<Zeroizing<Vec<u8>>> {
        self.sessions.decrypt(session_id, message)
    }

    /// Периодическая очистка: prekeys, vault, неактивные сессии, пропущенные ключи
    pub fn sweep_expired(&self, now: i64) -> Result<SweepReport> {
        let report = SweepReport {
            prekeys: self.prekeys.lock()?.sweep_expired(now),
            vault_keys: self.vault.sweep_expired(now)?,
            sessions: self.sessions.sweep_inactive(now)?.len(),
            skipped_keys: self.sessions.sweep_skipped_keys(now)?,
        };
        if report != SweepReport::default() {
            info!(target: "crypto::context", ?report, "Expired material removed");
        }
        Ok(report)
    }
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
