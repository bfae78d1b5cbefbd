//! Secure Messaging Protocols
//!
//! Этот модуль содержит Double Ratchet и wire-типы сообщений.
//!
//! ## Dataflow
//! ```text
//! После успешного X3DH:
//!
//! Alice (Initiator)                          Bob (Responder)
//! ==================                         =================
//!
//! initialize(root, Initiator)                initialize(root, Responder)
//!   send = chain(i→r), recv = chain(r→i)       send = chain(r→i), recv = chain(i→r)
//!
//! encrypt(msg1) header = A0  ─────────────→  A0 впервые: perform_dh_ratchet(A0)
//!                                              (receive step пропущен: A0 ещё не
//!                                               участвовал в root), rotate → B1,
//!                                              send step DH(B1, A0)
//!                                            decrypt(msg1) ✅ (chain i→r)
//!
//!                               ←─────────  encrypt(msg2) header = B1
//! Новый ключ B1: perform_dh_ratchet(B1)
//!   receive step DH(A0, B1) = DH(B1, A0)
//!   rotate → A1, send step DH(A1, B1)
//! decrypt(msg2) ✅
//! ```
//!
//! Responder не может отправлять, пока не получил первое сообщение:
//! его send chain появляется только после первого DH ratchet step.
//!
//! ## Security Properties
//!
//! ### Forward Secrecy
//! Компрометация текущих ключей НЕ раскрывает прошлые сообщения:
//! chain key шагает через HKDF, message keys не хранятся.
//!
//! ### Break-in Recovery
//! Новый DH ratchet step восстанавливает безопасность после компрометации.
//!
//! ### Out-of-Order Messages
//! Ограниченный кэш пропущенных ключей `(generation, counter)`.

pub mod double_ratchet;
pub mod skipped_keys;

use crate::error::Result;
use crate::utils::serialization;
use serde::{Deserialize, Serialize};

pub use double_ratchet::{DoubleRatchetEngine, RatchetPhase, RatchetState};

/// Направление цепочки
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Recv,
}

/// Роль стороны в сессии (кто инициировал X3DH)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// Длины цепочек на момент последнего DH ratchet step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLengths {
    pub send: u32,
    pub recv: u32,
}

pub const HEADER_LENGTH: usize = 32 + 4 + 4;

/// Заголовок сообщения (передаётся открыто, аутентифицируется как AAD)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Текущий DH ratchet public key отправителя
    pub ratchet_public: [u8; 32],
    /// Номер сообщения в текущей send chain отправителя
    pub counter: u32,
    /// Длина предыдущей send chain отправителя
    pub previous_chain_length: u32,
}

impl MessageHeader {
    /// Фиксированное кодирование: `ratchet_public || counter (BE) || previous_chain_length (BE)`
    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut out = [0u8; HEADER_LENGTH];
        out[..32].copy_from_slice(&self.ratchet_public);
        out[32..36].copy_from_slice(&self.counter.to_be_bytes());
        out[36..].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out
    }
}

/// Зашифрованное сообщение в wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub header: MessageHeader,
    /// AEAD envelope: `iv || tag || ciphertext`
    #[serde(with = "serde_bytes")]
    pub envelope: Vec<u8>,
}

impl RatchetMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialization::to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serialization::from_bytes(bytes)
    }
}
