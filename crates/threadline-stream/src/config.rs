use std::time::Duration;

use regex::Regex;

use crate::errors::StreamError;

/// Granularity at which raw text output is split into parts before it is
/// buffered.
#[derive(Clone, Debug, Default)]
pub enum Chunking {
    /// Forward every text delta as it arrives.
    None,
    /// One part per word including its trailing whitespace.
    #[default]
    Word,
    /// One part per line including its newlines.
    Line,
    /// Split after every match of the pattern.
    Pattern(Regex),
}

impl Chunking {
    /// Parses `none`, `word`, `line` or `regex:<pattern>`.
    pub fn parse(raw: &str) -> Result<Self, StreamError> {
        let trimmed = raw.trim();
        if let Some(pattern) = trimmed.strip_prefix("regex:") {
            let regex = Regex::new(pattern)
                .map_err(|e| StreamError::config(format!("invalid chunking pattern: {e}")))?;
            return Ok(Self::Pattern(regex));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "word" => Ok(Self::Word),
            "line" => Ok(Self::Line),
            other => Err(StreamError::config(format!(
                "unknown chunking mode `{other}` (expected none, word, line or regex:<pattern>)"
            ))),
        }
    }
}

/// Configuration for [`crate::DeltaStreamer`].
#[derive(Clone, Debug)]
pub struct StreamerConfig {
    pub chunking: Chunking,
    /// Minimum spacing between two delta writes.
    pub throttle: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            chunking: Chunking::Word,
            throttle: Duration::from_millis(250),
        }
    }
}

impl StreamerConfig {
    /// Builds a config from `THREADLINE_STREAM_CHUNKING` and
    /// `THREADLINE_STREAM_THROTTLE_MS`, keeping defaults for unset keys.
    pub fn from_env() -> Result<Self, StreamError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("THREADLINE_STREAM_CHUNKING") {
            config.chunking = Chunking::parse(&raw)?;
        }
        if let Ok(raw) = std::env::var("THREADLINE_STREAM_THROTTLE_MS") {
            config.throttle = threadline_core::config::env_duration_ms(&raw).ok_or_else(|| {
                StreamError::config(format!("invalid THREADLINE_STREAM_THROTTLE_MS: {raw}"))
            })?;
        }
        Ok(config)
    }

    pub fn chunking(mut self, chunking: Chunking) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }
}
