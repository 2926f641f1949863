use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt as _};
use threadline_core::{
    MessageDoc, MessageKey, NewStream, StoreError, StreamDelta, StreamId, StreamStore,
    TextStreamPart,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chunking::Chunker;
use crate::config::StreamerConfig;
use crate::errors::StreamError;

/// State shared between the streamer and its flush task.
#[derive(Default)]
struct Shared {
    cursor: u64,
    buffer: Vec<TextStreamPart>,
    last_write: Option<Instant>,
    in_flight: bool,
    aborted: bool,
    failure: Option<StoreError>,
}

/// Persists the parts of one generation as throttled, contiguous deltas.
///
/// Parts are chunked, buffered and written by a background flush task that
/// spaces writes at least `throttle` apart. At most one write is in flight.
/// The stream itself is created on the first non-empty write and retired by
/// [`DeltaStreamer::finish`]; a later `add_parts` opens a new stream at the
/// slot following the finalized messages.
pub struct DeltaStreamer<S: StreamStore + 'static> {
    store: Arc<S>,
    config: StreamerConfig,
    metadata: NewStream,
    chunker: Chunker,
    stream_id: Option<StreamId>,
    shared: Arc<Mutex<Shared>>,
    drain: Option<JoinHandle<()>>,
}

impl<S: StreamStore + 'static> DeltaStreamer<S> {
    pub fn new(store: Arc<S>, metadata: NewStream, config: StreamerConfig) -> Self {
        let chunker = Chunker::new(config.chunking.clone());
        Self {
            store,
            config,
            metadata,
            chunker,
            stream_id: None,
            shared: Arc::new(Mutex::new(Shared::default())),
            drain: None,
        }
    }

    /// Id of the open stream, if any part has been written since the last
    /// `finish`.
    pub fn stream_id(&self) -> Option<&StreamId> {
        self.stream_id.as_ref()
    }

    /// Slot the next stream will claim.
    pub fn next_key(&self) -> MessageKey {
        MessageKey::new(self.metadata.order, self.metadata.step_order)
    }

    /// True once the store rejected a delta for the open stream.
    pub async fn is_aborted(&self) -> bool {
        self.shared.lock().await.aborted
    }

    /// Chunks and buffers `parts`, starting a flush if none is running.
    ///
    /// Returns the error of a failed background flush, if one happened.
    pub async fn add_parts(&mut self, parts: Vec<TextStreamPart>) -> Result<(), StreamError> {
        {
            let shared = self.shared.lock().await;
            if let Some(err) = &shared.failure {
                return Err(err.clone().into());
            }
            if shared.aborted {
                debug!(stream_id = ?self.stream_id, "stream aborted, dropping parts");
                return Ok(());
            }
        }

        let chunks: Vec<TextStreamPart> = parts
            .into_iter()
            .flat_map(|part| self.chunker.push(part))
            .collect();
        if chunks.is_empty() {
            return Ok(());
        }
        let stream_id = self.open_stream().await?;

        let mut shared = self.shared.lock().await;
        shared.buffer.extend(chunks);
        if !shared.in_flight {
            shared.in_flight = true;
            self.drain = Some(tokio::spawn(drain(
                Arc::clone(&self.store),
                Arc::clone(&self.shared),
                stream_id,
                self.config.throttle,
            )));
        }
        Ok(())
    }

    /// Feeds every part of `parts` through [`Self::add_parts`].
    pub async fn consume<St>(&mut self, parts: St) -> Result<(), StreamError>
    where
        St: Stream<Item = TextStreamPart>,
    {
        let mut parts = std::pin::pin!(parts);
        while let Some(part) = parts.next().await {
            self.add_parts(vec![part]).await?;
        }
        Ok(())
    }

    /// Writes everything still buffered as the last delta, marks the stream
    /// finished and returns the key that follows `finalized`.
    ///
    /// Parts left over from a failed background write are retried here. If
    /// that write fails too, the stream is aborted and the first failure is
    /// returned.
    ///
    /// The returned key also becomes the slot of the next stream opened by
    /// this streamer.
    pub async fn finish(
        &mut self,
        finalized: &[MessageDoc],
    ) -> Result<Option<MessageKey>, StreamError> {
        if let Some(handle) = self.drain.take() {
            handle
                .await
                .map_err(|err| StreamError::Task(err.to_string()))?;
        }

        let tail = self.chunker.finish();
        let aborted = self.shared.lock().await.aborted;
        if !tail.is_empty() && !aborted {
            self.open_stream().await?;
            self.shared.lock().await.buffer.extend(tail);
        }

        let seed = self.advance_seed(finalized);
        let Some(stream_id) = self.stream_id.take() else {
            warn!(thread_id = %self.metadata.thread_id, "finish called on a streamer that never wrote a part");
            return Ok(seed);
        };

        let (final_delta, aborted, failure) = {
            let mut shared = self.shared.lock().await;
            let parts = std::mem::take(&mut shared.buffer);
            let delta = (!parts.is_empty()).then(|| StreamDelta {
                stream_id: stream_id.clone(),
                start: shared.cursor,
                end: shared.cursor + parts.len() as u64,
                parts,
            });
            let aborted = shared.aborted;
            let failure = shared.failure.take();
            *shared = Shared::default();
            (delta, aborted, failure)
        };

        if aborted {
            debug!(stream_id = %stream_id, "stream was aborted, not finishing");
            return Ok(seed);
        }
        let Some(failure) = failure else {
            self.store.finish_stream(&stream_id, final_delta).await?;
            debug!(stream_id = %stream_id, "finished stream");
            return Ok(seed);
        };

        // Unwritten parts restart at the last acknowledged cursor.
        match self.store.finish_stream(&stream_id, final_delta).await {
            Ok(()) => {
                debug!(stream_id = %stream_id, error = %failure, "finished stream after a failed write");
                Ok(seed)
            }
            Err(err) => {
                warn!(stream_id = %stream_id, error = %err, "could not finish stream, aborting it");
                if let Err(err) = self.store.abort_stream(&stream_id, &failure.to_string()).await {
                    warn!(stream_id = %stream_id, error = %err, "could not abort stream");
                }
                Err(failure.into())
            }
        }
    }

    async fn open_stream(&mut self) -> Result<StreamId, StreamError> {
        if let Some(stream_id) = &self.stream_id {
            return Ok(stream_id.clone());
        }
        let header = self.store.create_stream(self.metadata.clone()).await?;
        debug!(
            stream_id = %header.stream_id,
            thread_id = %header.thread_id,
            order = header.order,
            step_order = header.step_order,
            "opened stream"
        );
        self.stream_id = Some(header.stream_id.clone());
        Ok(header.stream_id)
    }

    fn advance_seed(&mut self, finalized: &[MessageDoc]) -> Option<MessageKey> {
        let Some(last) = finalized.last() else {
            warn!(thread_id = %self.metadata.thread_id, "finish called without finalized messages");
            return None;
        };
        let seed = MessageKey::new(last.order, last.step_order + 1);
        self.metadata.order = seed.order;
        self.metadata.step_order = seed.step_order;
        Some(seed)
    }
}

/// Flush loop: writes the buffer as one delta whenever the throttle window
/// allows, until the buffer is empty or the stream stops accepting writes.
async fn drain<S: StreamStore>(
    store: Arc<S>,
    shared: Arc<Mutex<Shared>>,
    stream_id: StreamId,
    throttle: Duration,
) {
    loop {
        let wait = {
            let mut state = shared.lock().await;
            if state.buffer.is_empty() || state.aborted || state.failure.is_some() {
                state.in_flight = false;
                return;
            }
            state
                .last_write
                .map_or(Duration::ZERO, |at| (at + throttle).saturating_duration_since(Instant::now()))
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let delta = {
            let mut state = shared.lock().await;
            if state.buffer.is_empty() {
                state.in_flight = false;
                return;
            }
            let parts = std::mem::take(&mut state.buffer);
            state.last_write = Some(Instant::now());
            StreamDelta {
                stream_id: stream_id.clone(),
                start: state.cursor,
                end: state.cursor + parts.len() as u64,
                parts,
            }
        };
        let (start, end) = (delta.start, delta.end);

        match store.append_delta(delta.clone()).await {
            Ok(true) => {
                shared.lock().await.cursor = end;
                debug!(stream_id = %stream_id, start, end, "wrote delta");
            }
            Ok(false) => {
                warn!(stream_id = %stream_id, start, "stream stopped accepting deltas, aborting");
                let mut state = shared.lock().await;
                state.aborted = true;
                state.buffer.clear();
                state.in_flight = false;
                return;
            }
            Err(err) => {
                warn!(stream_id = %stream_id, start, error = %err, "delta write failed");
                let mut state = shared.lock().await;
                // Unwritten parts go back in front of anything buffered since.
                let mut parts = delta.parts;
                parts.append(&mut state.buffer);
                state.buffer = parts;
                state.failure = Some(err);
                state.in_flight = false;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Chunking;
    use async_trait::async_trait;
    use serde_json::json;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use threadline_core::{
        ContentPart, MemoryStore, MessageId, MessageStatus, Role, StreamCursor, StreamHeader,
        StreamStatus, ThreadId, merge_deltas,
    };

    /// Memory store whose next `failing_writes` delta writes fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing_writes: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(writes: usize) -> Self {
            Self {
                failing_writes: AtomicUsize::new(writes),
                ..Self::default()
            }
        }

        fn check_write(&self) -> Result<(), StoreError> {
            let fail = self
                .failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(StoreError::Backend("transient".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StreamStore for FlakyStore {
        async fn create_stream(&self, stream: NewStream) -> Result<StreamHeader, StoreError> {
            self.inner.create_stream(stream).await
        }

        async fn stream(&self, stream_id: &StreamId) -> Result<Option<StreamHeader>, StoreError> {
            self.inner.stream(stream_id).await
        }

        async fn append_delta(&self, delta: StreamDelta) -> Result<bool, StoreError> {
            self.check_write()?;
            self.inner.append_delta(delta).await
        }

        async fn finish_stream(
            &self,
            stream_id: &StreamId,
            final_delta: Option<StreamDelta>,
        ) -> Result<(), StoreError> {
            self.check_write()?;
            self.inner.finish_stream(stream_id, final_delta).await
        }

        async fn abort_stream(&self, stream_id: &StreamId, reason: &str) -> Result<bool, StoreError> {
            self.inner.abort_stream(stream_id, reason).await
        }

        async fn list_streams(
            &self,
            thread_id: &ThreadId,
            statuses: &[StreamStatus],
        ) -> Result<Vec<StreamHeader>, StoreError> {
            self.inner.list_streams(thread_id, statuses).await
        }

        async fn list_deltas(
            &self,
            thread_id: &ThreadId,
            cursors: &[StreamCursor],
        ) -> Result<Vec<StreamDelta>, StoreError> {
            self.inner.list_deltas(thread_id, cursors).await
        }

        async fn delete_stream(&self, stream_id: &StreamId) -> Result<(), StoreError> {
            self.inner.delete_stream(stream_id).await
        }
    }

    async fn flaky_stream_after_failed_write(
        writes: usize,
    ) -> (Arc<FlakyStore>, DeltaStreamer<FlakyStore>, StreamId) {
        let store = Arc::new(FlakyStore::failing(writes));
        let mut s = DeltaStreamer::new(
            Arc::clone(&store),
            metadata(1),
            StreamerConfig::default().throttle(Duration::ZERO),
        );
        s.add_parts(vec![TextStreamPart::text("hello ")]).await.unwrap();
        let stream_id = s.stream_id().cloned().unwrap();
        if let Some(handle) = s.drain.take() {
            handle.await.unwrap();
        }
        let err = s
            .add_parts(vec![TextStreamPart::text("world ")])
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::Store(StoreError::Backend("transient".into())));
        (store, s, stream_id)
    }

    fn metadata(order: u64) -> NewStream {
        NewStream {
            thread_id: ThreadId::new("t1"),
            order,
            step_order: 0,
            agent_name: Some("assistant".into()),
            ..NewStream::default()
        }
    }

    fn streamer(store: &Arc<MemoryStore>, throttle: Duration) -> DeltaStreamer<MemoryStore> {
        DeltaStreamer::new(
            Arc::clone(store),
            metadata(1),
            StreamerConfig::default().throttle(throttle),
        )
    }

    async fn deltas(store: &MemoryStore, stream_id: &StreamId) -> Vec<StreamDelta> {
        store
            .list_deltas(
                &ThreadId::new("t1"),
                &[StreamCursor {
                    stream_id: stream_id.clone(),
                    cursor: 0,
                }],
            )
            .await
            .unwrap()
    }

    fn finalized(order: u64, step: u64) -> MessageDoc {
        MessageDoc {
            id: MessageId::new(format!("m{order}.{step}")),
            thread_id: ThreadId::new("t1"),
            order,
            step_order: step,
            tool: false,
            status: MessageStatus::Success,
            role: Role::Assistant,
            content: vec![ContentPart::text("done")],
            text: "done".into(),
            sources: Vec::new(),
            error: None,
            agent_name: None,
            model: None,
            provider: None,
            user_id: None,
            stream_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn streamed_text_reconstructs_after_finish() {
        let store = Arc::new(MemoryStore::new());
        let mut s = streamer(&store, Duration::ZERO);
        s.add_parts(vec![TextStreamPart::text("Hello wor")]).await.unwrap();
        s.add_parts(vec![TextStreamPart::text("ld")]).await.unwrap();
        let stream_id = s.stream_id().cloned().unwrap();
        s.finish(&[]).await.unwrap();

        let header = store.stream(&stream_id).await.unwrap().unwrap();
        assert_eq!(header.status, StreamStatus::Finished);
        assert_eq!(header.agent_name.as_deref(), Some("assistant"));

        let all = deltas(&store, &stream_id).await;
        let mut expected_start = 0;
        for delta in &all {
            assert_eq!(delta.start, expected_start);
            expected_start = delta.end;
        }
        let out = merge_deltas(&ThreadId::new("t1"), &[header], &[], &all).unwrap();
        assert_eq!(out.messages[0].text, "Hello world");
        assert_eq!(out.messages[0].status, MessageStatus::Success);
        assert_eq!(out.messages[0].order, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_are_spaced_by_throttle() {
        let store = Arc::new(MemoryStore::new());
        let mut s = streamer(&store, Duration::from_millis(250));
        s.add_parts(vec![TextStreamPart::text("a ")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stream_id = s.stream_id().cloned().unwrap();
        assert_eq!(deltas(&store, &stream_id).await.len(), 1);

        s.add_parts(vec![TextStreamPart::text("b ")]).await.unwrap();
        s.add_parts(vec![TextStreamPart::text("c ")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(deltas(&store, &stream_id).await.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let written = deltas(&store, &stream_id).await;
        assert_eq!(written.len(), 2);
        assert_eq!((written[1].start, written[1].end), (1, 3));
    }

    #[tokio::test]
    async fn rejected_delta_aborts_streamer() {
        let store = Arc::new(MemoryStore::new());
        let mut s = streamer(&store, Duration::ZERO);
        s.add_parts(vec![TextStreamPart::text("one ")]).await.unwrap();
        let stream_id = s.stream_id().cloned().unwrap();
        tokio::task::yield_now().await;
        store.abort_stream(&stream_id, "user stopped").await.unwrap();

        s.add_parts(vec![TextStreamPart::text("two ")]).await.unwrap();
        s.finish(&[]).await.unwrap();

        let header = store.stream(&stream_id).await.unwrap().unwrap();
        assert_eq!(header.status, StreamStatus::Aborted);
        let written = deltas(&store, &stream_id).await;
        assert_eq!(written.len(), 1);
    }

    #[tokio::test]
    async fn aborted_streamer_ignores_new_parts() {
        let store = Arc::new(MemoryStore::new());
        let mut s = streamer(&store, Duration::ZERO);
        s.add_parts(vec![TextStreamPart::text("x ")]).await.unwrap();
        let stream_id = s.stream_id().cloned().unwrap();
        store.abort_stream(&stream_id, "stop").await.unwrap();
        if let Some(handle) = s.drain.take() {
            handle.await.unwrap();
        }
        assert!(s.is_aborted().await);

        s.add_parts(vec![TextStreamPart::text("y ")]).await.unwrap();
        assert!(s.drain.is_none());
        assert!(deltas(&store, &stream_id).await.is_empty());
    }

    #[tokio::test]
    async fn store_failure_surfaces_on_next_call() {
        let store = Arc::new(MemoryStore::new());
        let mut s = streamer(&store, Duration::ZERO);
        s.add_parts(vec![TextStreamPart::text("x ")]).await.unwrap();
        let stream_id = s.stream_id().cloned().unwrap();
        store.delete_stream(&stream_id).await.unwrap();
        if let Some(handle) = s.drain.take() {
            handle.await.unwrap();
        }

        let err = s
            .add_parts(vec![TextStreamPart::text("y ")])
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::Store(StoreError::StreamNotFound(stream_id)));
        assert!(s.finish(&[]).await.is_err());
    }

    #[tokio::test]
    async fn finish_rewrites_parts_of_a_failed_write() {
        let (store, mut s, stream_id) = flaky_stream_after_failed_write(1).await;
        s.finish(&[]).await.unwrap();

        let header = store.stream(&stream_id).await.unwrap().unwrap();
        assert_eq!(header.status, StreamStatus::Finished);
        let written = store
            .list_deltas(
                &ThreadId::new("t1"),
                &[StreamCursor {
                    stream_id: stream_id.clone(),
                    cursor: 0,
                }],
            )
            .await
            .unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!((written[0].start, written[0].end), (0, 1));
        let out = merge_deltas(&ThreadId::new("t1"), &[header], &[], &written).unwrap();
        assert_eq!(out.messages[0].text, "hello ");
    }

    #[tokio::test]
    async fn finish_aborts_stream_when_store_keeps_failing() {
        let (store, mut s, stream_id) = flaky_stream_after_failed_write(2).await;
        let err = s.finish(&[]).await.unwrap_err();
        assert_eq!(err, StreamError::Store(StoreError::Backend("transient".into())));

        let header = store.stream(&stream_id).await.unwrap().unwrap();
        assert_eq!(header.status, StreamStatus::Aborted);
        assert!(header.abort_reason.unwrap().contains("transient"));
        let streaming = store
            .list_streams(&ThreadId::new("t1"), &[StreamStatus::Streaming])
            .await
            .unwrap();
        assert!(streaming.is_empty());
        assert!(s.stream_id().is_none());
    }

    #[tokio::test]
    async fn finish_without_parts_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let mut s = streamer(&store, Duration::ZERO);
        assert_eq!(s.finish(&[]).await.unwrap(), None);
        let streams = store
            .list_streams(&ThreadId::new("t1"), &[StreamStatus::Streaming, StreamStatus::Finished])
            .await
            .unwrap();
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn finish_seeds_the_next_stream() {
        let store = Arc::new(MemoryStore::new());
        let mut s = streamer(&store, Duration::ZERO);
        s.add_parts(vec![TextStreamPart::tool_call("c1", "f", json!({}))])
            .await
            .unwrap();
        let seed = s.finish(&[finalized(1, 0), finalized(1, 1)]).await.unwrap();
        assert_eq!(seed, Some(MessageKey::new(1, 2)));
        assert!(s.stream_id().is_none());

        s.add_parts(vec![TextStreamPart::text("after ")]).await.unwrap();
        let next = s.stream_id().cloned().unwrap();
        let header = store.stream(&next).await.unwrap().unwrap();
        assert_eq!(header.key(), MessageKey::new(1, 2));
    }

    #[tokio::test]
    async fn consume_reads_a_part_stream() {
        let store = Arc::new(MemoryStore::new());
        let mut s = DeltaStreamer::new(
            Arc::clone(&store),
            metadata(0),
            StreamerConfig::default()
                .chunking(Chunking::None)
                .throttle(Duration::ZERO),
        );
        let parts = futures::stream::iter(vec![
            TextStreamPart::text("a"),
            TextStreamPart::text("b"),
        ]);
        s.consume(parts).await.unwrap();
        let stream_id = s.stream_id().cloned().unwrap();
        s.finish(&[]).await.unwrap();
        let parts: usize = deltas(&store, &stream_id)
            .await
            .iter()
            .map(|d| d.parts.len())
            .sum();
        assert_eq!(parts, 2);
    }
}
