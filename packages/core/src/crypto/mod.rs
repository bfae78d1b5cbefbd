//! Криптографический модуль
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 CryptoContext (crate::context)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 SessionManager (client_api)                 │
//! │  - Управляет множественными сессиями                         │
//! │  - TTL неактивных сессий                                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 SecureSession (session_api)                 │
//! │  - Объединяет Handshake + Messaging + AEAD                   │
//! │  - Одна сессия = один контакт                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │   X3DHProtocol            │  │  DoubleRatchetEngine     │
//! │  - Prekey bundles         │  │  - Forward secrecy       │
//! │  - Hybrid KEM             │  │  - Break-in recovery     │
//! │  - Root secret            │  │  - Skipped keys cache    │
//! └───────────────────────────┘  └──────────────────────────┘
//!                │                           │
//!                └─────────────┬─────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  KeyEncapsulationService (X25519 [+ Kyber768])              │
//! │  SymmetricCipher (AES-256-GCM)                              │
//! │  SecureKeyVault (ключи, завёрнутые мастер-ключом)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Группы: [`sender_keys`] ведёт учёт доставки sender keys участникам,
//! сами ключи передаются через парные сессии.

/// AES-256-GCM envelope
pub mod cipher;

/// KEM: X25519 или гибрид X25519 + Kyber768 (feature `post-quantum`)
pub mod kem;

/// Identity key + signed/one-time prekeys
pub mod keys;

/// Key Agreement (X3DH)
pub mod handshake;

/// Secure Messaging (Double Ratchet)
pub mod messaging;

/// Session API - объединяет handshake + messaging
pub mod session_api;

/// Client API - управляет множественными сессиями
pub mod client_api;

pub mod vault;

pub mod sender_keys;

/// Идентификатор криптографического набора
pub type SuiteID = u16;

/// X25519 + AES-256-GCM + HKDF-SHA256
pub const CLASSIC_SUITE_ID: SuiteID = 1;

/// X25519 + Kyber768 + AES-256-GCM + HKDF-SHA256
pub const PQ_HYBRID_SUITE_ID: SuiteID = 2;

// ============================================================================
// Re-exports для удобства
// ============================================================================

pub use cipher::{Envelope, SymmetricCipher};
pub use client_api::SessionManager;
pub use handshake::{InitialHandshake, PrekeyBundle, X3DHProtocol};
pub use kem::{HybridKeyPair, KeyEncapsulationService};
pub use keys::{IdentityAndPrekeyStore, IdentityKeyPair};
pub use messaging::{DoubleRatchetEngine, MessageHeader, RatchetMessage, Role};
pub use sender_keys::GroupSenderKeyManager;
pub use session_api::SecureSession;
pub use vault::{KeyType, SecureKeyVault};
