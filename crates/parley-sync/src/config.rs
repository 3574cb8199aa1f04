use std::time::Duration;

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum message length in characters, counted after trimming. `None` = unlimited.
    pub max_message_len: Option<usize>,
    /// Upper bound on every store call; exceeding it is a transient failure.
    pub store_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_message_len: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

impl SyncConfig {
    /// Reads `PARLEY_MAX_MESSAGE_LEN` and `PARLEY_STORE_TIMEOUT_MS`; unset or
    /// unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let max_message_len = std::env::var("PARLEY_MAX_MESSAGE_LEN")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|len| *len > 0);

        let store_timeout = std::env::var("PARLEY_STORE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STORE_TIMEOUT);

        Self {
            max_message_len,
            store_timeout,
        }
    }
}
