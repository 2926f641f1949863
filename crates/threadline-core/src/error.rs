use crate::ids::{MessageId, StreamId, ThreadId};
use crate::message::{MessageKey, MessageStatus};

/// Errors returned by storage adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A concurrent transaction won; the caller may retry.
    #[error("transaction conflict: {0}")]
    Conflict(String),
    /// Another message already holds this `(thread, order, stepOrder)` slot.
    #[error("duplicate message key {key:?} in thread {thread_id}")]
    DuplicateKey {
        thread_id: ThreadId,
        key: MessageKey,
    },
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),
    /// A delta did not start where the stream's log ends.
    #[error("non-contiguous delta for stream {stream_id}: expected start {expected}, got {start}")]
    NonContiguousDelta {
        stream_id: StreamId,
        expected: u64,
        start: u64,
    },
    #[error("invalid pagination cursor: {0}")]
    InvalidCursor(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn invalid_cursor(message: impl Into<String>) -> Self {
        Self::InvalidCursor(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Structural violation found while merging deltas.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// A delta straddles the cursor, which an append-only log never produces.
    #[error(
        "misaligned delta for stream {stream_id}: [{start}, {end}) overlaps cursor {cursor}"
    )]
    MisalignedDelta {
        stream_id: StreamId,
        start: u64,
        end: u64,
        cursor: u64,
    },
}

/// Errors returned by the message ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),
    /// Terminal messages never change status again.
    #[error("message {id} is {from:?} and can no longer change status")]
    InvalidTransition { id: MessageId, from: MessageStatus },
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from polling streams and merging their deltas.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}
