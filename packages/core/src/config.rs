//! Централизованная конфигурация криптографического ядра
//!
//! Все константы и лимиты определены здесь. Глобального синглтона нет:
//! конфигурация создаётся один раз и передаётся в [`crate::context::CryptoContext`].

/// Основная структура конфигурации
#[derive(Debug, Clone)]
pub struct Config {
    // ============================================
    // AEAD
    // ============================================

    /// Максимальный размер plaintext для AEAD (в байтах)
    pub max_plaintext_len: usize,

    // ============================================
    // DOUBLE RATCHET ПАРАМЕТРЫ
    // ============================================

    /// Максимальное количество пропущенных сообщений (DoS защита)
    pub max_skipped_messages: u32,

    /// Максимальный возраст пропущенных ключей сообщений (в секундах)
    /// По умолчанию: 7 дней
    pub max_skipped_message_age_seconds: i64,

    /// Сколько предыдущих ratchet ключей собеседника помнить для отказа в replay
    pub remembered_ratchet_keys: usize,

    // ============================================
    // ВРЕМЕННЫЕ ПАРАМЕТРЫ
    // ============================================

    /// TTL неактивной сессии (в секундах)
    /// По умолчанию: 24 часа
    pub session_ttl_secs: i64,

    /// Окно валидности one-time prekey (в секундах)
    /// По умолчанию: 10 минут
    pub one_time_prekey_ttl_secs: i64,

    /// Сколько хранить предыдущие signed prekeys после ротации (в секундах)
    /// По умолчанию: 30 дней
    pub signed_prekey_grace_secs: i64,

    /// TTL неиспользуемого ключа в хранилище (в секундах)
    /// По умолчанию: 15 минут
    pub vault_key_ttl_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // AEAD
            max_plaintext_len: 64 * 1024 * 1024,

            // Double Ratchet
            max_skipped_messages: 1000,
            max_skipped_message_age_seconds: 7 * 24 * 60 * 60, // 7 days
            remembered_ratchet_keys: 32,

            // Временные параметры
            session_ttl_secs: 24 * 60 * 60,            // 24 hours
            one_time_prekey_ttl_secs: 10 * 60,         // 10 minutes
            signed_prekey_grace_secs: 30 * 24 * 60 * 60, // 30 days
            vault_key_ttl_secs: 15 * 60,               // 15 minutes
        }
    }
}

impl Config {
    /// Создать конфигурацию из переменных окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Переопределяем значения из env, если они заданы
        if let Some(parsed) = env_value("MAX_SKIPPED_MESSAGES") {
            config.max_skipped_messages = parsed;
        }

        if let Some(parsed) = env_value("MAX_SKIPPED_MESSAGE_AGE_SECONDS") {
            config.max_skipped_message_age_seconds = parsed;
        }

        if let Some(parsed) = env_value("SESSION_TTL_SECS") {
            config.session_ttl_secs = parsed;
        }

        if let Some(parsed) = env_value("ONE_TIME_PREKEY_TTL_SECS") {
            config.one_time_prekey_ttl_secs = parsed;
        }

        if let Some(parsed) = env_value("VAULT_KEY_TTL_SECS") {
            config.vault_key_ttl_secs = parsed;
        }

        if let Some(parsed) = env_value("MAX_PLAINTEXT_LEN") {
            config.max_plaintext_len = parsed;
        }

        config
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(target: "config", variable = name, "Ignoring unparsable value");
            None
        }
    }
}
