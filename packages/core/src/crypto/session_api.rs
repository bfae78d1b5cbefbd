//! Session API - High-level interface for secure messaging sessions
//!
//! Объединяет X3DH (handshake) + Double Ratchet + AEAD в одну сессию
//! с одним контактом.
//!
//! ## Архитектура
//!
//! ```text
//! SecureSession
//!   ├── SessionMetadata        - id, участники, created_at, last_activity
//!   ├── DoubleRatchetEngine    - ключи сообщений
//!   └── SymmetricCipher        - AES-256-GCM envelope
//! ```
//!
//! ## Типичный сценарий использования
//!
//! ### Alice (инициатор)
//! ```text
//! 1. Alice получает Bob's PrekeyBundle от сервера
//! 2. session = SecureSession::init_as_initiator(..)
//! 3. message = session.encrypt(plaintext)
//! 4. Отправляет session.pending_handshake() + message → Bob
//! ```
//!
//! ### Bob (получатель)
//! ```text
//! 1. session = SecureSession::init_as_responder(.., handshake)
//! 2. plaintext = session.decrypt(message)
//! 3. reply = session.encrypt(..)
//! ```
//!
//! AAD каждого сообщения: `MESSAGE_AAD || IK_initiator || IK_responder || header`.
//! Расшифровка транзакционна: при любой ошибке состояние ratchet не меняется.

use crate::config::Config;
use crate::crypto::cipher::{Envelope, SymmetricCipher, MESSAGE_AAD};
use crate::crypto::handshake::{InitialHandshake, PrekeyBundle, X3DHProtocol};
use crate::crypto::kem::ClassicalKeyPair;
use crate::crypto::keys::{IdentityAndPrekeyStore, IdentityKeyPair};
use crate::crypto::messaging::{
    DoubleRatchetEngine, MessageHeader, RatchetMessage, RatchetState, Role,
};
use crate::error::{CryptoError, Result};
use crate::storage::models::StoredSession;
use crate::utils::serialization;
use crate::utils::time::{current_timestamp, is_expired};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Метаданные сессии
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub local_id: String,
    pub contact_id: String,
    pub role: Role,
    pub created_at: i64,
    pub last_activity: i64,
}

/// Содержимое `StoredSession::session_data`
#[derive(Serialize, Deserialize)]
struct SessionSnapshot {
    role: Role,
    #[serde(with = "serde_bytes")]
    associated_data: Vec<u8>,
    ratchet: RatchetState,
    pending_handshake: Option<InitialHandshake>,
}

/// Защищённая сессия с одним контактом
pub struct SecureSession {
    metadata: SessionMetadata,
    engine: DoubleRatchetEngine,
    cipher: SymmetricCipher,
    /// IK_initiator || IK_responder
    associated_data: Vec<u8>,
    /// Handshake, который инициатор прикладывает к сообщениям до первого ответа
    pending_handshake: Option<InitialHandshake>,
}

impl SecureSession {
    /// Инициализировать сессию как инициатор (Alice)
    ///
    /// Выполняет X3DH по bundle собеседника и инициализирует Double Ratchet.
    pub fn init_as_initiator(
        protocol: &X3DHProtocol<'_>,
        local_identity: &IdentityKeyPair,
        local_id: &str,
        contact_id: &str,
        remote_bundle: &PrekeyBundle,
        config: &Config,
    ) -> Result<Self> {
        use tracing::debug;

        let ephemeral = ClassicalKeyPair::generate();
        let outcome = protocol.consume_bundle(remote_bundle, local_identity, &ephemeral)?;

        let mut engine = DoubleRatchetEngine::new(config);
        engine.initialize(&outcome.root_secret[..], Role::Initiator)?;

        let associated_data =
            associated_data(&local_identity.dh_public(), &remote_bundle.identity_key);
        let session = Self::new(
            Role::Initiator,
            local_id,
            contact_id,
            engine,
            config,
            associated_data,
            Some(outcome.handshake()),
        );

        debug!(
            target: "crypto::session",
            session_id = %session.metadata.session_id,
            contact_id,
            one_time_prekey = ?outcome.consumed_prekey_id,
            "Initiator session created"
        );
        Ok(session)
    }

    /// Инициализировать сессию как получатель (Bob) по handshake инициатора
    pub fn init_as_responder(
        protocol: &X3DHProtocol<'_>,
        store: &mut IdentityAndPrekeyStore,
        local_id: &str,
        contact_id: &str,
        handshake: &InitialHandshake,
        config: &Config,
    ) -> Result<Self> {
        use tracing::debug;

        let root_secret = protocol.accept(store, handshake)?;

        let mut engine = DoubleRatchetEngine::new(config);
        engine.initialize(&root_secret[..], Role::Responder)?;

        let associated_data =
            associated_data(&handshake.initiator_identity, &store.identity().dh_public());
        let session = Self::new(
            Role::Responder,
            local_id,
            contact_id,
            engine,
            config,
            associated_data,
            None,
        );

        debug!(
            target: "crypto::session",
            session_id = %session.metadata.session_id,
            contact_id,
            "Responder session created"
        );
        Ok(session)
    }

    fn new(
        role: Role,
        local_id: &str,
        contact_id: &str,
        engine: DoubleRatchetEngine,
        config: &Config,
        associated_data: Vec<u8>,
        pending_handshake: Option<InitialHandshake>,
    ) -> Self {
        let now = current_timestamp();
        Self {
            metadata: SessionMetadata {
                session_id: uuid::Uuid::new_v4().to_string(),
                local_id: local_id.to_string(),
                contact_id: contact_id.to_string(),
                role,
                created_at: now,
                last_activity: now,
            },
            engine,
            cipher: SymmetricCipher::new(config),
            associated_data,
            pending_handshake,
        }
    }

    /// Зашифровать сообщение
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage> {
        let (header, message_key) = self.engine.next_send_key()?;
        let aad = self.message_aad(&header);
        let envelope = self.cipher.encrypt(plaintext, &message_key[..], &aad)?;

        self.metadata.last_activity = current_timestamp();

        tracing::trace!(
            target: "crypto::session",
            session_id = %self.metadata.session_id,
            counter = header.counter,
            envelope_len = envelope.len(),
            "Message encrypted"
        );

        Ok(RatchetMessage {
            header,
            envelope: envelope.to_bytes(),
        })
    }

    /// Расшифровать сообщение
    ///
    /// Ratchet продвигается на копии состояния; копия принимается только
    /// после успешной проверки AEAD tag.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Zeroizing<Vec<u8>>> {
        use tracing::debug;

        let envelope = Envelope::from_bytes(&message.envelope)?;

        let mut engine = self.engine.clone();
        let message_key = engine.receive_key(&message.header)?;
        let aad = self.message_aad(&message.header);
        let plaintext = self
            .cipher
            .decrypt(&envelope, &message_key[..], &aad)
            .map_err(|e| {
                debug!(
                    target: "crypto::session",
                    session_id = %self.metadata.session_id,
                    counter = message.header.counter,
                    "Message rejected"
                );
                e
            })?;

        self.engine = engine;
        self.metadata.last_activity = current_timestamp();
        if self.pending_handshake.is_some() {
            // Собеседник ответил: handshake ему больше не нужен
            self.pending_handshake = None;
        }
        Ok(plaintext)
    }

    pub fn session_id(&self) -> &str {
        &self.metadata.session_id
    }

    pub fn contact_id(&self) -> &str {
        &self.metadata.contact_id
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn engine(&self) -> &DoubleRatchetEngine {
        &self.engine
    }

    pub fn pending_handshake(&self) -> Option<&InitialHandshake> {
        self.pending_handshake.as_ref()
    }

    pub fn is_expired(&self, now: i64, ttl_secs: i64) -> bool {
        is_expired(self.metadata.last_activity, now, ttl_secs)
    }

    pub fn sweep_skipped_keys(&mut self, now: i64) -> usize {
        self.engine.sweep_skipped_keys(now)
    }

    /// Teardown: ключи обнуляются, дальнейшие операции → `SessionTerminated`
    pub fn erase(&mut self) {
        self.engine.erase();
        self.pending_handshake = None;
        tracing::debug!(
            target: "crypto::session",
            session_id = %self.metadata.session_id,
            "Session erased"
        );
    }

    /// Сериализовать сессию для внешнего хранилища
    pub fn to_record(&self) -> Result<StoredSession> {
        let snapshot = SessionSnapshot {
            role: self.metadata.role,
            associated_data: self.associated_data.clone(),
            ratchet: self.engine.to_state()?,
            pending_handshake: self.pending_handshake.clone(),
        };
        let session_data = serialization::to_bytes(&snapshot)?;

        Ok(StoredSession {
            session_id: self.metadata.session_id.clone(),
            local_id: self.metadata.local_id.clone(),
            contact_id: self.metadata.contact_id.clone(),
            session_data,
            last_used: self.metadata.last_activity,
            created_at: self.metadata.created_at,
        })
    }

    /// Восстановить сессию из хранилища
    pub fn from_record(record: &StoredSession, config: &Config) -> Result<Self> {
        let snapshot: SessionSnapshot = serialization::from_bytes(&record.session_data)?;
        if snapshot.ratchet.role != snapshot.role {
            return Err(CryptoError::InvalidInputError(
                "Session role does not match ratchet role".to_string(),
            ));
        }
        let engine = DoubleRatchetEngine::from_state(&snapshot.ratchet, config)?;

        Ok(Self {
            metadata: SessionMetadata {
                session_id: record.session_id.clone(),
                local_id: record.local_id.clone(),
                contact_id: record.contact_id.clone(),
                role: snapshot.role,
                created_at: record.created_at,
                last_activity: record.last_used,
            },
            engine,
            cipher: SymmetricCipher::new(config),
            associated_data: snapshot.associated_data.clone(),
            pending_handshake: snapshot.pending_handshake.clone(),
        })
    }

    fn message_aad(&self, header: &MessageHeader) -> Vec<u8> {
        let header_bytes = header.to_bytes();
        let mut aad =
            Vec::with_capacity(MESSAGE_AAD.len() + self.associated_data.len() + header_bytes.len());
        aad.extend_from_slice(MESSAGE_AAD);
        aad.extend_from_slice(&self.associated_data);
        aad.extend_from_slice(&header_bytes);
        aad
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("metadata", &self.metadata)
            .field("engine", &self.engine)
            .field("pending_handshake", &self.pending_handshake.is_some())
            .finish()
    }
}

fn associated_data(initiator_identity: &[u8; 32], responder_identity: &[u8; 32]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(initiator_identity);
    ad.extend_from_slice(responder_identity);
    ad
}
