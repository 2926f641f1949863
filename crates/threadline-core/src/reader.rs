//! Polling side of streaming: fetch what changed since the last poll and fold
//! it into the persisted history.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::delta::{StreamCursor, StreamStatus};
use crate::error::SyncError;
use crate::ids::ThreadId;
use crate::merge::{MergeOutput, StreamState, merge_deltas};
use crate::message::{MessageDoc, MessageKey, MessageStatus};
use crate::orphan::filter_out_orphaned_tool_messages;
use crate::store::StreamStore;

const ACTIVE: &[StreamStatus] = &[StreamStatus::Streaming];

/// Lists the thread's streams in `statuses` (streaming only when empty),
/// fetches their deltas from each prior cursor and merges them.
///
/// Feed `output.streams` back as `prior` on the next poll.
pub async fn sync_streams<S: StreamStore + ?Sized>(
    store: &S,
    thread_id: &ThreadId,
    prior: &[Arc<StreamState>],
    statuses: &[StreamStatus],
) -> Result<MergeOutput, SyncError> {
    let statuses = if statuses.is_empty() {
        ACTIVE
    } else {
        statuses
    };
    let headers = store.list_streams(thread_id, statuses).await?;
    let cursors: Vec<StreamCursor> = headers
        .iter()
        .map(|header| StreamCursor {
            stream_id: header.stream_id.clone(),
            cursor: prior
                .iter()
                .find(|state| state.stream_id == header.stream_id)
                .map_or(0, |state| state.cursor),
        })
        .collect();
    let deltas = if cursors.is_empty() {
        Vec::new()
    } else {
        store.list_deltas(thread_id, &cursors).await?
    };
    debug!(
        thread_id = %thread_id,
        streams = headers.len(),
        deltas = deltas.len(),
        "synced streams"
    );
    Ok(merge_deltas(thread_id, &headers, prior, &deltas)?)
}

/// Overlays streamed messages on persisted ones.
///
/// A streamed message fills its slot unless a finalized persisted message
/// already holds it; a persisted pending placeholder gives way to the live
/// view. The result is ascending and free of orphaned tool results.
pub fn combine_messages(persisted: &[MessageDoc], streamed: &[MessageDoc]) -> Vec<MessageDoc> {
    let finalized: HashSet<MessageKey> = persisted
        .iter()
        .filter(|m| m.status != MessageStatus::Pending)
        .map(MessageDoc::key)
        .collect();
    let live: Vec<&MessageDoc> = streamed
        .iter()
        .filter(|m| !finalized.contains(&m.key()))
        .collect();
    let live_keys: HashSet<MessageKey> = live.iter().map(|m| m.key()).collect();

    let mut combined: Vec<MessageDoc> = persisted
        .iter()
        .filter(|m| m.status != MessageStatus::Pending || !live_keys.contains(&m.key()))
        .chain(live)
        .cloned()
        .collect();
    combined.sort_by_key(MessageDoc::key);
    filter_out_orphaned_tool_messages(&combined)
}
