// Construct E2EE Core
// X3DH + Double Ratchet engine with hybrid post-quantum KEM

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod storage;
pub mod utils;

// Re-exports для удобства
pub use config::Config;
pub use context::CryptoContext;
pub use error::{CryptoError, Result};
