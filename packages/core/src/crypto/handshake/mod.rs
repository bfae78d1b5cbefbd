//! Key Agreement Protocols
//!
//! Этот модуль содержит протокол установки ключей (key agreement).
//!
//! Цель: установить общий root secret между двумя сторонами без предварительного
//! обмена секретами. Root secret затем инициализирует Double Ratchet.
//!
//! ## Dataflow
//! ```text
//! Alice (инициатор)                          Bob (получатель)
//! ==================                         =================
//!
//!                                            0. publish_bundle() → сервер
//! 1. Получает Bob's PrekeyBundle от сервера
//! 2. Генерирует ephemeral key
//! 3. X3DHProtocol::consume_bundle()
//!    → AgreementOutcome { root_secret, .. }
//! 4. Отправляет InitialHandshake вместе
//!    с первым сообщением
//!                                            1. Получает InitialHandshake
//!                                            2. X3DHProtocol::accept()
//!                                               → root_secret (тот же!)
//!                                               one-time prekey удалён навсегда
//! ```

pub mod x3dh;

pub use x3dh::{
    AgreementOutcome, InitialHandshake, OneTimePrekeyPublic, PrekeyBundle, X3DHProtocol,
};
