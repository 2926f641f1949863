use threadline_core::StoreError;

/// Errors returned by the delta streamer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Invalid streamer configuration.
    #[error("config error: {0}")]
    Config(String),
    /// The stream store failed, either inline or in a background flush.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The background flush task panicked or was cancelled.
    #[error("flush task failed: {0}")]
    Task(String),
}

impl StreamError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
