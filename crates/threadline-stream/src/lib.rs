//! Producer side of streamed generations.
//!
//! A [`DeltaStreamer`] takes the raw parts of one generation, re-chunks text
//! on word, line or custom boundaries and persists them as contiguous
//! `[start, end)` deltas through a [`threadline_core::StreamStore`], spacing
//! writes by a throttle interval.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use threadline_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let store = Arc::new(MemoryStore::new());
//! let metadata = NewStream {
//!     thread_id: ThreadId::new("thread-1"),
//!     order: 1,
//!     ..NewStream::default()
//! };
//! let mut streamer = DeltaStreamer::new(store, metadata, StreamerConfig::from_env()?);
//! streamer.add_parts(vec![TextStreamPart::text("Hello, ")]).await?;
//! streamer.add_parts(vec![TextStreamPart::text("world")]).await?;
//! streamer.finish(&[]).await?;
//! # Ok(())
//! # }
//! ```

/// Text re-chunking applied before parts are buffered.
pub mod chunking;
/// Streamer configuration.
pub mod config;
/// Public error type of the streamer.
pub mod errors;
/// Common imports for typical usage.
pub mod prelude;
/// The throttled delta writer.
pub mod streamer;

pub use chunking::Chunker;
pub use config::{Chunking, StreamerConfig};
pub use errors::StreamError;
pub use streamer::DeltaStreamer;
