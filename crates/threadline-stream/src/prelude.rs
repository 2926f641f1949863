//! Common imports for producing streams.
pub use crate::{Chunking, DeltaStreamer, StreamError, StreamerConfig};
pub use threadline_core::{MemoryStore, NewStream, StreamStore, TextStreamPart, ThreadId};
