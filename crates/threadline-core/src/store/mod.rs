//! Storage ports consumed by the ledger, the streamer and the reader.
//!
//! Message mutations run as one synchronous closure inside a store
//! transaction, so read-max-then-insert is atomic for every adapter. Reads go
//! through single-partition range scans ordered by `(order, stepOrder)`.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::delta::{NewStream, StreamCursor, StreamDelta, StreamHeader, StreamStatus};
use crate::error::StoreError;
use crate::ids::{MessageId, StreamId, ThreadId};
use crate::message::{MessageDoc, MessageKey, MessageStatus, Thread};

pub use memory::{MemoryStore, MemoryStoreConfig};

/// Direction of a scan or a page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Point reads and writes available inside a transaction.
pub trait MessageTxn {
    fn thread(&self, id: &ThreadId) -> Result<Option<Thread>, StoreError>;

    fn insert_thread(&mut self, thread: Thread) -> Result<(), StoreError>;

    fn message(&self, id: &MessageId) -> Result<Option<MessageDoc>, StoreError>;

    /// Highest `(order, stepOrder)` held by any message of the thread.
    fn max_key(&self, thread_id: &ThreadId) -> Result<Option<MessageKey>, StoreError>;

    /// Highest `stepOrder` within one `order` of the thread.
    fn max_step(&self, thread_id: &ThreadId, order: u64) -> Result<Option<u64>, StoreError>;

    /// All messages of the thread with the given status, ascending by key.
    fn messages_with_status(
        &self,
        thread_id: &ThreadId,
        status: MessageStatus,
    ) -> Result<Vec<MessageDoc>, StoreError>;

    /// Inserts a new message. Fails with `DuplicateKey` if its slot is taken.
    fn insert_message(&mut self, message: MessageDoc) -> Result<(), StoreError>;

    /// Replaces an existing message with the same id. The key must not change.
    fn replace_message(&mut self, message: MessageDoc) -> Result<(), StoreError>;
}

/// One range scan over the `(thread, status, tool, order, stepOrder)` index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexScan {
    pub thread_id: ThreadId,
    pub status: MessageStatus,
    pub tool: bool,
    /// Only messages with `order <= up_to_and_including`.
    pub up_to_and_including: Option<u64>,
    pub sort: SortOrder,
}

impl IndexScan {
    /// True when `key` lies strictly past `after` in scan direction.
    pub fn is_past(&self, key: MessageKey, after: Option<MessageKey>) -> bool {
        match (after, self.sort) {
            (None, _) => true,
            (Some(after), SortOrder::Asc) => key > after,
            (Some(after), SortOrder::Desc) => key < after,
        }
    }
}

/// A batch of rows returned by [`MessageStore::scan`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanPage {
    pub messages: Vec<MessageDoc>,
    pub has_more: bool,
}

/// Transactional document store holding threads and messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Runs `f` atomically. Writes made through the transaction become visible
    /// only if `f` returns `Ok`.
    async fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + Send,
        F: FnOnce(&mut dyn MessageTxn) -> Result<T, E> + Send;

    /// Reads one thread outside any transaction.
    async fn thread(&self, id: &ThreadId) -> Result<Option<Thread>, StoreError>;

    /// Reads up to `limit` rows of one partition, strictly past `after`.
    async fn scan(
        &self,
        scan: &IndexScan,
        after: Option<MessageKey>,
        limit: usize,
    ) -> Result<ScanPage, StoreError>;
}

/// Persistence for stream headers and their append-only delta logs.
#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn create_stream(&self, stream: NewStream) -> Result<StreamHeader, StoreError>;

    async fn stream(&self, stream_id: &StreamId) -> Result<Option<StreamHeader>, StoreError>;

    /// Appends a delta. Returns `false` when the stream is no longer streaming
    /// and the delta was rejected.
    async fn append_delta(&self, delta: StreamDelta) -> Result<bool, StoreError>;

    /// Appends the optional last delta and marks the stream finished.
    async fn finish_stream(
        &self,
        stream_id: &StreamId,
        final_delta: Option<StreamDelta>,
    ) -> Result<(), StoreError>;

    /// Marks a streaming stream aborted. Returns `false` if it had already
    /// stopped streaming.
    async fn abort_stream(&self, stream_id: &StreamId, reason: &str) -> Result<bool, StoreError>;

    /// Headers of the thread's streams in the given states, sorted by key.
    async fn list_streams(
        &self,
        thread_id: &ThreadId,
        statuses: &[StreamStatus],
    ) -> Result<Vec<StreamHeader>, StoreError>;

    /// Deltas of each listed stream whose `start` is at or past its cursor.
    async fn list_deltas(
        &self,
        thread_id: &ThreadId,
        cursors: &[StreamCursor],
    ) -> Result<Vec<StreamDelta>, StoreError>;

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<(), StoreError>;
}
