// In-memory storage для тестов и non-WASM платформ

use crate::crypto::handshake::PrekeyBundle;
use crate::crypto::sender_keys::SenderKeyRecord;
use crate::crypto::vault::VaultEntry;
use crate::error::{CryptoError, Result};
use crate::storage::models::StoredSession;
use crate::storage::SessionStore;
use std::collections::HashMap;

/// In-memory хранилище
pub struct MemoryStorage {
    sessions: HashMap<String, StoredSession>,
    vault_entries: HashMap<String, VaultEntry>,
    sender_keys: HashMap<(String, String, String), SenderKeyRecord>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            vault_entries: HashMap::new(),
            sender_keys: HashMap::new(),
        }
    }

    // === Vault ===

    pub fn save_vault_entry(&mut self, entry: VaultEntry) -> Result<()> {
        self.vault_entries.insert(entry.key_id.clone(), entry);
        Ok(())
    }

    pub fn load_vault_entry(&self, key_id: &str) -> Result<Option<VaultEntry>> {
        Ok(self.vault_entries.get(key_id).cloned())
    }

    pub fn delete_vault_entry(&mut self, key_id: &str) -> Result<()> {
        self.vault_entries.remove(key_id);
        Ok(())
    }

    // === Sender keys ===

    pub fn save_sender_key(&mut self, record: SenderKeyRecord) -> Result<()> {
        let key = (
            record.group_id.clone(),
            record.sender_id.clone(),
            record.recipient_id.clone(),
        );
        self.sender_keys.insert(key, record);
        Ok(())
    }

    pub fn load_sender_keys_for_group(&self, group_id: &str) -> Result<Vec<SenderKeyRecord>> {
        let mut records: Vec<SenderKeyRecord> = self
            .sender_keys
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect();

        records.sort_by(|a, b| {
            (&a.sender_id, &a.recipient_id).cmp(&(&b.sender_id, &b.recipient_id))
        });
        Ok(records)
    }

    // === Утилиты ===

    pub fn clear_all(&mut self) -> Result<()> {
        self.sessions.clear();
        self.vault_entries.clear();
        self.sender_keys.clear();
        Ok(())
    }
}

impl SessionStore for MemoryStorage {
    fn save_session(&mut self, session: StoredSession) -> Result<()> {
        self.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> Result<Option<StoredSession>> {
        Ok(self.sessions.get(session_id).cloned())
    }

    fn load_all_sessions(&self) -> Result<Vec<StoredSession>> {
        Ok(self.sessions.values().cloned().collect())
    }

    fn delete_session(&mut self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id);
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Каталог prekey bundles по `(user_id, device_id)`
///
/// Модель серверного каталога: one-time prekey из опубликованного bundle
/// выдаётся не более одного раза, дальше bundle отдаётся без него.
#[derive(Default)]
pub struct BundleDirectory {
    bundles: HashMap<(String, String), PrekeyBundle>,
}

impl BundleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Опубликовать (заменить) bundle устройства
    pub fn publish(&mut self, user_id: &str, bundle: PrekeyBundle) {
        tracing::debug!(
            target: "storage::bundles",
            user_id,
            device_id = %bundle.device_id,
            one_time_prekey = bundle.one_time_prekey.as_ref().map(|p| p.key_id),
            "Bundle published"
        );
        self.bundles
            .insert((user_id.to_string(), bundle.device_id.clone()), bundle);
    }

    /// Получить bundle устройства, забирая one-time prekey
    pub fn fetch_bundle(&mut self, user_id: &str, device_id: &str) -> Result<PrekeyBundle> {
        let stored = self
            .bundles
            .get_mut(&(user_id.to_string(), device_id.to_string()))
            .ok_or_else(|| {
                CryptoError::KeyNotFoundError(format!("bundle {}/{}", user_id, device_id))
            })?;

        let mut bundle = stored.clone();
        bundle.one_time_prekey = stored.one_time_prekey.take();
        Ok(bundle)
    }

    /// Устройства пользователя с опубликованным bundle
    pub fn devices(&self, user_id: &str) -> Vec<String> {
        let mut devices: Vec<String> = self
            .bundles
            .keys()
            .filter(|(user, _)| user == user_id)
            .map(|(_, device)| device.clone())
            .collect();
        devices.sort();
        devices
    }

    pub fn remove(&mut self, user_id: &str, device_id: &str) -> bool {
        self.bundles
            .remove(&(user_id.to_string(), device_id.to_string()))
            .is_some()
    }
}
