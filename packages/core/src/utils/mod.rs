// Вспомогательные утилиты

pub mod b64;
pub mod serialization;
pub mod time;
