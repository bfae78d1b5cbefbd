//! Group Sender Keys
//!
//! Учёт того, какие участники группы получили текущий sender key отправителя.
//! Сам sender key шифруется и доставляется через парные сессии; здесь хранится
//! только уже зашифрованный blob и его поколение.

use crate::error::{CryptoError, Result};
use crate::utils::time::current_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Запись о sender key, доставленном одному получателю
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    pub group_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(with = "serde_bytes")]
    pub encrypted_key: Vec<u8>,
    pub key_generation: u32,
    pub updated_at: i64,
}

type RecordKey = (String, String, String);

#[derive(Default)]
struct SenderKeyTables {
    records: HashMap<RecordKey, SenderKeyRecord>,
    /// Текущее поколение sender key по (group, sender)
    generations: HashMap<(String, String), u32>,
}

/// Менеджер sender keys для групп
#[derive(Default)]
pub struct GroupSenderKeyManager {
    tables: RwLock<SenderKeyTables>,
}

impl GroupSenderKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Сохранить (upsert) sender key для получателя.
    ///
    /// Запись со старым поколением отклоняется.
    pub fn store_sender_key(
        &self,
        group_id: &str,
        sender_id: &str,
        recipient_id: &str,
        encrypted_key: Vec<u8>,
        key_generation: u32,
    ) -> Result<()> {
        let mut tables = self.tables.write()?;
        let key = record_key(group_id, sender_id, recipient_id);

        if let Some(existing) = tables.records.get(&key) {
            if key_generation < existing.key_generation {
                return Err(CryptoError::InvalidInputError(format!(
                    "Sender key generation {} is older than stored {}",
                    key_generation, existing.key_generation
                )));
            }
        }

        let current = tables
            .generations
            .entry((group_id.to_string(), sender_id.to_string()))
            .or_insert(key_generation);
        if key_generation > *current {
            *current = key_generation;
        }

        tables.records.insert(
            key,
            SenderKeyRecord {
                group_id: group_id.to_string(),
                sender_id: sender_id.to_string(),
                recipient_id: recipient_id.to_string(),
                encrypted_key,
                key_generation,
                updated_at: current_timestamp(),
            },
        );

        tracing::debug!(
            target: "crypto::sender_keys",
            group_id,
            sender_id,
            recipient_id,
            key_generation,
            "Stored sender key"
        );
        Ok(())
    }

    pub fn get_sender_key(
        &self,
        group_id: &str,
        sender_id: &str,
        recipient_id: &str,
    ) -> Result<Option<SenderKeyRecord>> {
        let tables = self.tables.read()?;
        Ok(tables
            .records
            .get(&record_key(group_id, sender_id, recipient_id))
            .cloned())
    }

    /// Текущее поколение sender key отправителя (0, если ещё не было)
    pub fn current_generation(&self, group_id: &str, sender_id: &str) -> Result<u32> {
        let tables = self.tables.read()?;
        Ok(tables
            .generations
            .get(&(group_id.to_string(), sender_id.to_string()))
            .copied()
            .unwrap_or(0))
    }

    /// Участники (кроме отправителя), у которых нет sender key текущего поколения
    pub fn get_missing_recipients<'a, I>(
        &self,
        group_id: &str,
        sender_id: &str,
        membership: I,
    ) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let tables = self.tables.read()?;
        let generation = tables
            .generations
            .get(&(group_id.to_string(), sender_id.to_string()))
            .copied()
            .unwrap_or(0);

        let missing = membership
            .into_iter()
            .filter(|member| *member != sender_id)
            .filter(|member| {
                tables
                    .records
                    .get(&record_key(group_id, sender_id, member))
                    .map_or(true, |record| record.key_generation < generation)
            })
            .map(str::to_string)
            .collect();
        Ok(missing)
    }

    /// Начать новое поколение sender key. Все получатели становятся "missing".
    pub fn rotate_sender_key(&self, group_id: &str, sender_id: &str) -> Result<u32> {
        let mut tables = self.tables.write()?;
        let generation = tables
            .generations
            .entry((group_id.to_string(), sender_id.to_string()))
            .or_insert(0);
        *generation = generation
            .checked_add(1)
            .ok_or_else(|| CryptoError::InternalError("sender key generation overflow".to_string()))?;
        let new_generation = *generation;

        tracing::debug!(
            target: "crypto::sender_keys",
            group_id,
            sender_id,
            generation = new_generation,
            "Rotated sender key"
        );
        Ok(new_generation)
    }

    /// Удалить участника: его sender keys и ключи, полученные им.
    ///
    /// Возвращает отправителей, которым нужно ротировать sender key.
    pub fn remove_member(&self, group_id: &str, member_id: &str) -> Result<BTreeSet<String>> {
        let mut tables = self.tables.write()?;
        let mut affected_senders = BTreeSet::new();

        tables.records.retain(|(group, sender, recipient), _| {
            if group != group_id {
                return true;
            }
            if recipient == member_id && sender != member_id {
                affected_senders.insert(sender.clone());
            }
            sender != member_id && recipient != member_id
        });
        tables
            .generations
            .remove(&(group_id.to_string(), member_id.to_string()));

        tracing::debug!(
            target: "crypto::sender_keys",
            group_id,
            member_id,
            affected = affected_senders.len(),
            "Removed group member"
        );
        Ok(affected_senders)
    }
}

fn record_key(group_id: &str, sender_id: &str, recipient_id: &str) -> RecordKey {
    (
        group_id.to_string(),
        sender_id.to_string(),
        recipient_id.to_string(),
    )
}
