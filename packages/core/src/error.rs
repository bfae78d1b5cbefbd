// Типы ошибок криптографического ядра

use thiserror::Error;

/// Ошибки криптографического ядра.
///
/// Ошибки проверки (подпись, AEAD tag) возвращаются вызывающему коду как есть:
/// ядро их не повторяет и не логирует вместе с ключевым материалом.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key agreement failed: {0}")]
    KeyAgreementError(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerificationError(String),

    #[error("One-time prekey {0} is exhausted")]
    PrekeyExhaustedError(u32),

    #[error("Authentication failed: ciphertext rejected")]
    AuthenticationError,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Ratchet chain is not initialized")]
    ChainNotInitializedError,

    #[error("Session not found: {0}")]
    SessionNotFoundError(String),

    #[error("Key not found: {0}")]
    KeyNotFoundError(String),

    /// Мастер-ключ хранилища не может открыть запись: все ключи, завёрнутые им,
    /// потеряны, активные сессии требуют полного re-keying.
    #[error("Vault master key failure: {0}")]
    VaultMasterKeyError(String),

    #[error("Ratchet public key was already used")]
    StaleRatchetKey,

    #[error("Too many skipped messages: {requested} exceeds limit {limit}")]
    TooManySkippedMessages { requested: u32, limit: u32 },

    #[error("Session has been terminated")]
    SessionTerminated,

    #[error("Payload too large: {size} bytes exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Failed to generate keys: {0}")]
    KeyGenerationError(String),

    #[error("Invalid input: {0}")]
    InvalidInputError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl CryptoError {
    /// Ошибки, после которых продолжать работу с текущим ключевым материалом нельзя.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CryptoError::VaultMasterKeyError(_))
    }

    /// Ошибки проверки целостности/подлинности (возможная активная атака).
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::AuthenticationError | CryptoError::SignatureVerificationError(_)
        )
    }

    pub(crate) fn invalid_length(expected: usize, actual: usize) -> Self {
        CryptoError::InvalidKeyLength { expected, actual }
    }
}

impl From<ed25519_dalek::SignatureError> for CryptoError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        CryptoError::SignatureVerificationError(err.to_string())
    }
}

impl From<bincode::Error> for CryptoError {
    fn from(err: bincode::Error) -> Self {
        CryptoError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::SerializationError(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for CryptoError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        CryptoError::InternalError("lock poisoned".to_string())
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
