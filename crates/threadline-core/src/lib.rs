//! Ordering and reconstruction core for streamed LLM conversation threads.
//!
//! - [`MessageLedger`] assigns `(order, stepOrder)` keys transactionally and
//!   pages through persisted messages across status partitions.
//! - [`merge_deltas`] rebuilds in-flight messages from stream deltas,
//!   tolerating duplicates, reordering and gaps.
//! - [`sync_streams`] and [`combine_messages`] join both views for a reader.
//!
//! Storage is reached only through the ports in [`store`]; [`MemoryStore`]
//! implements both of them.

pub mod config;
pub mod delta;
pub mod error;
pub mod ids;
pub mod merge;
pub mod message;
pub mod observability;
pub mod ordering;
pub mod orphan;
pub mod paginate;
pub mod reader;
pub mod store;

pub use config::LedgerConfig;
pub use delta::{NewStream, StreamCursor, StreamDelta, StreamHeader, StreamStatus, TextStreamPart};
pub use error::{LedgerError, MergeError, StoreError, SyncError};
pub use ids::{MessageId, StreamId, ThreadId};
pub use merge::{MergeOutput, StreamState, apply_deltas_to_stream_message, merge_deltas};
pub use message::{
    ContentPart, MessageDoc, MessageKey, MessageStatus, NewMessage, NewThread, Role, Source,
    Thread, ToolCallArgs,
};
pub use ordering::{AddMessagesOptions, AddedMessages, MessageFilters, MessageLedger, MessagePage, PaginationOpts};
pub use orphan::filter_out_orphaned_tool_messages;
pub use reader::{combine_messages, sync_streams};
pub use store::{MemoryStore, MemoryStoreConfig, MessageStore, SortOrder, StreamStore};
