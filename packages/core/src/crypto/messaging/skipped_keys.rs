//! Кэш ключей пропущенных сообщений
//!
//! Ключ кэша: `(generation, counter)`. Записи вставляются в порядке роста
//! generation и counter, поэтому первая запись BTreeMap всегда самая старая.

use crate::utils::time::is_expired;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

#[derive(Clone)]
struct SkippedEntry {
    key: Zeroizing<[u8; 32]>,
    stored_at: i64,
}

/// Сериализуемая запись для snapshot сессии
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SkippedKeyRecord {
    #[zeroize(skip)]
    pub generation: u32,
    #[zeroize(skip)]
    pub counter: u32,
    pub key: [u8; 32],
    #[zeroize(skip)]
    pub stored_at: i64,
}

/// Ограниченный кэш пропущенных message keys
#[derive(Clone)]
pub struct SkippedKeyCache {
    entries: BTreeMap<(u32, u32), SkippedEntry>,
    max_entries: usize,
    max_age_secs: i64,
}

impl SkippedKeyCache {
    pub fn new(max_entries: usize, max_age_secs: i64) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_entries,
            max_age_secs,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, generation: u32, counter: u32) -> bool {
        self.entries.contains_key(&(generation, counter))
    }

    /// Сохранить ключ; при переполнении вытесняется самая старая запись
    pub fn insert(&mut self, generation: u32, counter: u32, key: Zeroizing<[u8; 32]>, now: i64) {
        self.entries
            .insert((generation, counter), SkippedEntry { key, stored_at: now });

        while self.entries.len() > self.max_entries {
            if let Some(((old_generation, old_counter), _)) = self.entries.pop_first() {
                tracing::trace!(
                    target: "crypto::double_ratchet",
                    generation = old_generation,
                    counter = old_counter,
                    "Evicted oldest skipped message key"
                );
            }
        }
    }

    /// Забрать ключ (одноразово)
    pub fn take(&mut self, generation: u32, counter: u32) -> Option<Zeroizing<[u8; 32]>> {
        self.entries
            .remove(&(generation, counter))
            .map(|entry| entry.key)
    }

    /// Удалить все записи поколений младше `min_generation`
    pub fn evict_before_generation(&mut self, min_generation: u32) -> usize {
        let keep = self.entries.split_off(&(min_generation, 0));
        let removed = self.entries.len();
        self.entries = keep;
        removed
    }

    /// Удалить записи старше `max_age_secs`
    pub fn sweep_expired(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        let max_age = self.max_age_secs;
        self.entries
            .retain(|_, entry| !is_expired(entry.stored_at, now, max_age));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn to_records(&self) -> Vec<SkippedKeyRecord> {
        self.entries
            .iter()
            .map(|(&(generation, counter), entry)| SkippedKeyRecord {
                generation,
                counter,
                key: *entry.key,
                stored_at: entry.stored_at,
            })
            .collect()
    }

    pub fn restore(&mut self, records: &[SkippedKeyRecord]) {
        for record in records {
            self.insert(
                record.generation,
                record.counter,
                Zeroizing::new(record.key),
                record.stored_at,
            );
        }
    }
}

impl std::fmt::Debug for SkippedKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkippedKeyCache")
            .field("len", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
