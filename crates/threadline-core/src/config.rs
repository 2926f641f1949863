use std::time::Duration;

/// Parses the boolean spellings accepted by every `THREADLINE_*` flag.
pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Parses a whole number of milliseconds.
pub fn env_duration_ms(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_millis)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// Tuning for [`crate::MessageLedger`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Attempts made when a transaction loses to a concurrent writer.
    pub max_transaction_retries: usize,
    /// Page size used when a caller does not pass `num_items`.
    pub default_page_size: usize,
    /// Upper bound applied to any requested page size.
    pub max_page_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_transaction_retries: 5,
            default_page_size: 100,
            max_page_size: 1000,
        }
    }
}

impl LedgerConfig {
    /// Reads `THREADLINE_TXN_RETRIES`, `THREADLINE_PAGE_SIZE` and
    /// `THREADLINE_MAX_PAGE_SIZE`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_transaction_retries: env_usize("THREADLINE_TXN_RETRIES")
                .unwrap_or(defaults.max_transaction_retries),
            default_page_size: env_usize("THREADLINE_PAGE_SIZE")
                .unwrap_or(defaults.default_page_size),
            max_page_size: env_usize("THREADLINE_MAX_PAGE_SIZE").unwrap_or(defaults.max_page_size),
        }
    }

    pub fn max_transaction_retries(mut self, retries: usize) -> Self {
        self.max_transaction_retries = retries;
        self
    }

    pub fn default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size;
        self
    }

    pub fn max_page_size(mut self, size: usize) -> Self {
        self.max_page_size = size;
        self
    }

    /// Clamps a requested page size to `1..=max_page_size`.
    pub(crate) fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}
