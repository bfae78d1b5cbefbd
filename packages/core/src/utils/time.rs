// Время и таймеры

use chrono::Utc;

/// Получить текущий timestamp в секундах с UNIX epoch (i64)
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Истёк ли срок жизни объекта, созданного/использованного в `since`
pub fn is_expired(since: i64, now: i64, ttl_secs: i64) -> bool {
    now.saturating_sub(since) >= ttl_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_expired() {
        assert!(!is_expired(100, 150, 60));
        assert!(is_expired(100, 160, 60));
        assert!(is_expired(100, 1_000, 60));
    }

    #[test]
    fn test_current_timestamp_is_positive() {
        assert!(current_timestamp() > 1_600_000_000);
    }
}
