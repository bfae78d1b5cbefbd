// Модели данных для хранилища

use crate::error::Result;
use crate::utils::serialization;
use serde::{Deserialize, Serialize};

/// Сессия Double Ratchet в хранилище (СЕРИАЛИЗОВАННАЯ)
///
/// `session_data` содержит ключевой материал в открытом виде: внешнее
/// хранилище обязано шифровать его само.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub session_id: String,
    pub local_id: String,
    pub contact_id: String,
    #[serde(with = "serde_bytes")]
    pub session_data: Vec<u8>, // Bincode сериализация SessionSnapshot
    pub last_used: i64,
    pub created_at: i64,
}

impl StoredSession {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialization::to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serialization::from_bytes(bytes)
    }
}

impl std::fmt::Debug for StoredSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredSession")
            .field("session_id", &self.session_id)
            .field("local_id", &self.local_id)
            .field("contact_id", &self.contact_id)
            .field("session_data_len", &self.session_data.len())
            .field("last_used", &self.last_used)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_session_data() {
        let record = StoredSession {
            session_id: "s1".to_string(),
            local_id: "alice".to_string(),
            contact_id: "bob".to_string(),
            session_data: vec![0xAB; 4],
            last_used: 10,
            created_at: 5,
        };

        let printed = format!("{:?}", record);
        assert!(printed.contains("session_data_len: 4"));
        assert!(!printed.contains("171"));
        assert_eq!(StoredSession::from_bytes(&record.to_bytes().unwrap()).unwrap(), record);
    }
}
