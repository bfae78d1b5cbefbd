//! Client API - управление множеством сессий
//!
//! `SessionManager` хранит сессии по `session_id`. Каждая сессия лежит за
//! своим `Arc<Mutex<_>>`: операции над одной сессией сериализуются, разные
//! сессии обрабатываются параллельно. Сама таблица защищена `RwLock`.

use crate::config::Config;
use crate::crypto::messaging::RatchetMessage;
use crate::crypto::session_api::SecureSession;
use crate::error::{CryptoError, Result};
use crate::storage::SessionStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub type SharedSession = Arc<Mutex<SecureSession>>;

pub struct SessionManager {
    sessions: RwLock<HashMap<String, SharedSession>>,
    config: Arc<Config>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Зарегистрировать сессию, возвращает её id
    pub fn insert(&self, session: SecureSession) -> Result<String> {
        let session_id = session.session_id().to_string();
        let contact_id = session.contact_id().to_string();

        let mut sessions = self.sessions.write()?;
        sessions.insert(session_id.clone(), Arc::new(Mutex::new(session)));

        debug!(target: "crypto::session", %session_id, %contact_id, "Session registered");
        Ok(session_id)
    }

    pub fn get(&self, session_id: &str) -> Result<SharedSession> {
        let sessions = self.sessions.read()?;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| CryptoError::SessionNotFoundError(session_id.to_string()))
    }

    pub fn encrypt(&self, session_id: &str, plaintext: &[u8]) -> Result<RatchetMessage> {
        let session = self.get(session_id)?;
        let mut session = session.lock()?;
        session.encrypt(plaintext)
    }

    pub fn decrypt(&self, session_id: &str, message: &RatchetMessage) -> Result<Zeroizing<Vec<u8>>> {
        let session = self.get(session_id)?;
        let mut session = session.lock()?;
        session.decrypt(message)
    }

    pub fn has_session(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.read()?.contains_key(session_id))
    }

    /// Самая свежая сессия с контактом
    pub fn session_for_contact(&self, contact_id: &str) -> Result<Option<String>> {
        let sessions = self.sessions.read()?;
        let mut best: Option<(i64, String)> = None;
        for (session_id, session) in sessions.iter() {
            let session = session.lock()?;
            if session.contact_id() != contact_id {
                continue;
            }
            let last_activity = session.metadata().last_activity;
            if best.as_ref().map_or(true, |(ts, _)| last_activity > *ts) {
                best = Some((last_activity, session_id.clone()));
            }
        }
        Ok(best.map(|(_, session_id)| session_id))
    }

    pub fn active_sessions_count(&self) -> Result<usize> {
        Ok(self.sessions.read()?.len())
    }

    /// Завершить сессию: ключи обнуляются, запись удаляется
    pub fn teardown(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()?
            .remove(session_id)
            .ok_or_else(|| CryptoError::SessionNotFoundError(session_id.to_string()))?;
        lock_for_cleanup(session_id, &session).erase();
        Ok(())
    }

    /// Удалить сессии без активности дольше `session_ttl_secs`.
    /// Отравленные сессии удаляются вместе с просроченными.
    pub fn sweep_inactive(&self, now: i64) -> Result<Vec<String>> {
        let ttl = self.config.session_ttl_secs;
        let mut sessions = self.sessions.write()?;

        let mut expired = Vec::new();
        for (session_id, session) in sessions.iter() {
            let poisoned = session.is_poisoned();
            if poisoned || lock_for_cleanup(session_id, session).is_expired(now, ttl) {
                expired.push(session_id.clone());
            }
        }

        for session_id in &expired {
            if let Some(session) = sessions.remove(session_id) {
                lock_for_cleanup(session_id, &session).erase();
            }
        }

        if !expired.is_empty() {
            info!(target: "crypto::session", removed = expired.len(), "Swept inactive sessions");
        }
        Ok(expired)
    }

    /// TTL-очистка пропущенных ключей во всех сессиях
    pub fn sweep_skipped_keys(&self, now: i64) -> Result<usize> {
        let sessions = self.sessions.read()?;
        let mut removed = 0;
        for (session_id, session) in sessions.iter() {
            removed += lock_for_cleanup(session_id, session).sweep_skipped_keys(now);
        }
        Ok(removed)
    }

    /// Сохранить все сессии во внешнее хранилище
    pub fn persist<S: SessionStore>(&self, store: &mut S) -> Result<usize> {
        let sessions = self.sessions.read()?;
        for session in sessions.values() {
            store.save_session(session.lock()?.to_record()?)?;
        }
        debug!(target: "crypto::session", count = sessions.len(), "Sessions persisted");
        Ok(sessions.len())
    }

    /// Загрузить сессию из внешнего хранилища
    pub fn restore<S: SessionStore>(&self, store: &S, session_id: &str) -> Result<()> {
        let record = store
            .load_session(session_id)?
            .ok_or_else(|| CryptoError::SessionNotFoundError(session_id.to_string()))?;
        let session = SecureSession::from_record(&record, &self.config)?;
        self.insert(session)?;
        Ok(())
    }

    /// Загрузить все сессии из внешнего хранилища
    pub fn restore_all<S: SessionStore>(&self, store: &S) -> Result<usize> {
        let records = store.load_all_sessions()?;
        let count = records.len();
        for record in records {
            self.insert(SecureSession::from_record(&record, &self.config)?)?;
        }
        Ok(count)
    }
}

/// Блокировка для очистки: ключи обнуляются и в отравленной сессии
fn lock_for_cleanup<'a>(session_id: &str, session: &'a SharedSession) -> MutexGuard<'a, SecureSession> {
    session.lock().unwrap_or_else(|poisoned| {
        warn!(target: "crypto::session", %session_id, "Recovering poisoned session lock");
        PoisonError::into_inner(poisoned)
    })
}
