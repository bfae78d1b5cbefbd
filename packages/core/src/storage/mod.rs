// Storage: записи для внешнего хранилища + in-memory адаптеры
//
// Ядро не делает I/O: сессии, обёрнутые ключи vault и sender keys
// сериализуются в записи, а куда их класть решает приложение.

pub mod memory;
pub mod models;

use crate::error::Result;
use models::StoredSession;

pub use memory::{BundleDirectory, MemoryStorage};

/// Хранилище сессий по `session_id`
pub trait SessionStore {
    fn save_session(&mut self, session: StoredSession) -> Result<()>;

    fn load_session(&self, session_id: &str) -> Result<Option<StoredSession>>;

    fn load_all_sessions(&self) -> Result<Vec<StoredSession>>;

    fn delete_session(&mut self, session_id: &str) -> Result<()>;
}
