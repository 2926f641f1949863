use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{IndexScan, MessageStore, MessageTxn, ScanPage, SortOrder, StreamStore};
use crate::config::{env_duration_ms, parse_bool_env};
use crate::delta::{NewStream, StreamCursor, StreamDelta, StreamHeader, StreamStatus};
use crate::error::StoreError;
use crate::ids::{MessageId, StreamId, ThreadId};
use crate::message::{MessageDoc, MessageKey, MessageStatus, Thread};

/// Configuration for [`MemoryStore`].
#[derive(Clone, Debug)]
pub struct MemoryStoreConfig {
    /// How long a finished or aborted stream and its deltas are kept before
    /// deletion. `None` keeps them forever.
    pub finished_stream_retention: Option<Duration>,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            finished_stream_retention: Some(Duration::from_secs(300)),
        }
    }
}

impl MemoryStoreConfig {
    /// Reads `THREADLINE_STREAM_RETENTION_MS` (`off` disables cleanup).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("THREADLINE_STREAM_RETENTION_MS") {
            if parse_bool_env(&raw) == Some(false) {
                config.finished_stream_retention = None;
            } else if let Some(retention) = env_duration_ms(&raw) {
                config.finished_stream_retention = Some(retention);
            }
        }
        config
    }

    pub fn finished_stream_retention(mut self, retention: Option<Duration>) -> Self {
        self.finished_stream_retention = retention;
        self
    }
}

#[derive(Default)]
struct Tables {
    threads: HashMap<ThreadId, Thread>,
    messages: HashMap<MessageId, MessageDoc>,
    keys: HashMap<ThreadId, BTreeMap<MessageKey, MessageId>>,
}

impl Tables {
    fn commit(&mut self, staged: Staged) {
        for thread in staged.threads.into_values() {
            self.threads.insert(thread.id.clone(), thread);
        }
        for message in staged.messages.into_values() {
            self.keys
                .entry(message.thread_id.clone())
                .or_default()
                .insert(message.key(), message.id.clone());
            self.messages.insert(message.id.clone(), message);
        }
    }
}

struct Staged {
    threads: HashMap<ThreadId, Thread>,
    messages: HashMap<MessageId, MessageDoc>,
}

/// Copy-on-write view over the tables; discarded unless the closure succeeds.
struct MemoryTxn<'a> {
    base: &'a Tables,
    threads: HashMap<ThreadId, Thread>,
    messages: HashMap<MessageId, MessageDoc>,
    keys: HashMap<ThreadId, BTreeMap<MessageKey, MessageId>>,
}

impl<'a> MemoryTxn<'a> {
    fn new(base: &'a Tables) -> Self {
        Self {
            base,
            threads: HashMap::new(),
            messages: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    fn into_staged(self) -> Staged {
        Staged {
            threads: self.threads,
            messages: self.messages,
        }
    }

    fn key_taken(&self, thread_id: &ThreadId, key: &MessageKey) -> bool {
        let in_base = self
            .base
            .keys
            .get(thread_id)
            .is_some_and(|keys| keys.contains_key(key));
        let staged = self
            .keys
            .get(thread_id)
            .is_some_and(|keys| keys.contains_key(key));
        in_base || staged
    }

    fn thread_keys(&self, thread_id: &ThreadId) -> impl Iterator<Item = &BTreeMap<MessageKey, MessageId>> {
        self.base
            .keys
            .get(thread_id)
            .into_iter()
            .chain(self.keys.get(thread_id))
    }
}

impl MessageTxn for MemoryTxn<'_> {
    fn thread(&self, id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        Ok(self
            .threads
            .get(id)
            .or_else(|| self.base.threads.get(id))
            .cloned())
    }

    fn insert_thread(&mut self, thread: Thread) -> Result<(), StoreError> {
        if self.thread(&thread.id)?.is_some() {
            return Err(StoreError::Backend(format!(
                "thread already exists: {}",
                thread.id
            )));
        }
        self.threads.insert(thread.id.clone(), thread);
        Ok(())
    }

    fn message(&self, id: &MessageId) -> Result<Option<MessageDoc>, StoreError> {
        Ok(self
            .messages
            .get(id)
            .or_else(|| self.base.messages.get(id))
            .cloned())
    }

    fn max_key(&self, thread_id: &ThreadId) -> Result<Option<MessageKey>, StoreError> {
        Ok(self
            .thread_keys(thread_id)
            .filter_map(|keys| keys.keys().next_back().copied())
            .max())
    }

    fn max_step(&self, thread_id: &ThreadId, order: u64) -> Result<Option<u64>, StoreError> {
        let range = MessageKey::new(order, 0)..=MessageKey::new(order, u64::MAX);
        Ok(self
            .thread_keys(thread_id)
            .filter_map(|keys| keys.range(range.clone()).next_back())
            .map(|(key, _)| key.step_order)
            .max())
    }

    fn messages_with_status(
        &self,
        thread_id: &ThreadId,
        status: MessageStatus,
    ) -> Result<Vec<MessageDoc>, StoreError> {
        let mut ids: Vec<(MessageKey, &MessageId)> = self
            .thread_keys(thread_id)
            .flat_map(|keys| keys.iter().map(|(key, id)| (*key, id)))
            .collect();
        ids.sort();
        ids.dedup();
        let mut out = Vec::new();
        for (_, id) in ids {
            if let Some(message) = self.message(id)?
                && message.status == status
            {
                out.push(message);
            }
        }
        Ok(out)
    }

    fn insert_message(&mut self, message: MessageDoc) -> Result<(), StoreError> {
        let key = message.key();
        if self.key_taken(&message.thread_id, &key) {
            return Err(StoreError::DuplicateKey {
                thread_id: message.thread_id.clone(),
                key,
            });
        }
        if self.message(&message.id)?.is_some() {
            return Err(StoreError::Backend(format!(
                "message already exists: {}",
                message.id
            )));
        }
        self.keys
            .entry(message.thread_id.clone())
            .or_default()
            .insert(key, message.id.clone());
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    fn replace_message(&mut self, message: MessageDoc) -> Result<(), StoreError> {
        let existing = self
            .message(&message.id)?
            .ok_or_else(|| StoreError::MessageNotFound(message.id.clone()))?;
        if existing.key() != message.key() || existing.thread_id != message.thread_id {
            return Err(StoreError::Backend(format!(
                "message {} cannot move to a different slot",
                message.id
            )));
        }
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }
}

struct StreamEntry {
    header: StreamHeader,
    deltas: Vec<StreamDelta>,
    next_start: u64,
}

impl StreamEntry {
    fn push(&mut self, delta: StreamDelta) -> Result<(), StoreError> {
        if delta.start != self.next_start {
            return Err(StoreError::NonContiguousDelta {
                stream_id: delta.stream_id,
                expected: self.next_start,
                start: delta.start,
            });
        }
        self.next_start = delta.end;
        self.deltas.push(delta);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    tables: RwLock<Tables>,
    streams: DashMap<StreamId, StreamEntry>,
    config: MemoryStoreConfig,
}

/// In-memory storage for tests, demos and single-process deployments.
///
/// Message transactions are serialized behind one async lock; stream logs
/// live in a concurrent map keyed by stream id.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                config,
                ..MemoryInner::default()
            }),
        }
    }

    fn schedule_cleanup(&self, stream_id: StreamId) {
        let Some(retention) = self.inner.config.finished_stream_retention else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if inner.streams.remove(&stream_id).is_some() {
                debug!(stream_id = %stream_id, "deleted retired stream");
            }
        });
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + Send,
        F: FnOnce(&mut dyn MessageTxn) -> Result<T, E> + Send,
    {
        let mut tables = self.inner.tables.write().await;
        let mut txn = MemoryTxn::new(&tables);
        let out = f(&mut txn)?;
        let staged = txn.into_staged();
        tables.commit(staged);
        Ok(out)
    }

    async fn thread(&self, id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        Ok(self.inner.tables.read().await.threads.get(id).cloned())
    }

    async fn scan(
        &self,
        scan: &IndexScan,
        after: Option<MessageKey>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        let tables = self.inner.tables.read().await;
        let Some(keys) = tables.keys.get(&scan.thread_id) else {
            return Ok(ScanPage::default());
        };
        let ordered: Box<dyn Iterator<Item = (&MessageKey, &MessageId)> + Send> = match scan.sort {
            SortOrder::Asc => Box::new(keys.iter()),
            SortOrder::Desc => Box::new(keys.iter().rev()),
        };
        let mut matching = ordered
            .filter(|(key, _)| scan.is_past(**key, after))
            .filter(|(key, _)| scan.up_to_and_including.is_none_or(|max| key.order <= max))
            .filter_map(|(_, id)| tables.messages.get(id))
            .filter(|message| message.status == scan.status && message.tool == scan.tool);
        let messages: Vec<MessageDoc> = matching.by_ref().take(limit).cloned().collect();
        let has_more = matching.next().is_some();
        Ok(ScanPage { messages, has_more })
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn create_stream(&self, stream: NewStream) -> Result<StreamHeader, StoreError> {
        let header = StreamHeader::from_new(StreamId::generate(), stream);
        self.inner.streams.insert(
            header.stream_id.clone(),
            StreamEntry {
                header: header.clone(),
                deltas: Vec::new(),
                next_start: 0,
            },
        );
        debug!(stream_id = %header.stream_id, thread_id = %header.thread_id, order = header.order, step_order = header.step_order, "created stream");
        Ok(header)
    }

    async fn stream(&self, stream_id: &StreamId) -> Result<Option<StreamHeader>, StoreError> {
        Ok(self
            .inner
            .streams
            .get(stream_id)
            .map(|entry| entry.header.clone()))
    }

    async fn append_delta(&self, delta: StreamDelta) -> Result<bool, StoreError> {
        let mut entry = self
            .inner
            .streams
            .get_mut(&delta.stream_id)
            .ok_or_else(|| StoreError::StreamNotFound(delta.stream_id.clone()))?;
        if entry.header.status != StreamStatus::Streaming {
            return Ok(false);
        }
        entry.push(delta)?;
        Ok(true)
    }

    async fn finish_stream(
        &self,
        stream_id: &StreamId,
        final_delta: Option<StreamDelta>,
    ) -> Result<(), StoreError> {
        {
            let mut entry = self
                .inner
                .streams
                .get_mut(stream_id)
                .ok_or_else(|| StoreError::StreamNotFound(stream_id.clone()))?;
            if entry.header.status != StreamStatus::Streaming {
                debug!(stream_id = %stream_id, status = ?entry.header.status, "finish on stopped stream ignored");
                return Ok(());
            }
            if let Some(delta) = final_delta {
                entry.push(delta)?;
            }
            entry.header.status = StreamStatus::Finished;
        }
        self.schedule_cleanup(stream_id.clone());
        Ok(())
    }

    async fn abort_stream(&self, stream_id: &StreamId, reason: &str) -> Result<bool, StoreError> {
        {
            let mut entry = self
                .inner
                .streams
                .get_mut(stream_id)
                .ok_or_else(|| StoreError::StreamNotFound(stream_id.clone()))?;
            if entry.header.status != StreamStatus::Streaming {
                return Ok(false);
            }
            entry.header.status = StreamStatus::Aborted;
            entry.header.abort_reason = Some(reason.to_string());
        }
        self.schedule_cleanup(stream_id.clone());
        Ok(true)
    }

    async fn list_streams(
        &self,
        thread_id: &ThreadId,
        statuses: &[StreamStatus],
    ) -> Result<Vec<StreamHeader>, StoreError> {
        let mut headers: Vec<StreamHeader> = self
            .inner
            .streams
            .iter()
            .filter(|entry| {
                entry.header.thread_id == *thread_id && statuses.contains(&entry.header.status)
            })
            .map(|entry| entry.header.clone())
            .collect();
        headers.sort_by(|a, b| {
            a.key()
                .cmp(&b.key())
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        Ok(headers)
    }

    async fn list_deltas(
        &self,
        thread_id: &ThreadId,
        cursors: &[StreamCursor],
    ) -> Result<Vec<StreamDelta>, StoreError> {
        let mut out = Vec::new();
        for cursor in cursors {
            let Some(entry) = self.inner.streams.get(&cursor.stream_id) else {
                continue;
            };
            if entry.header.thread_id != *thread_id {
                continue;
            }
            out.extend(
                entry
                    .deltas
                    .iter()
                    .filter(|delta| delta.start >= cursor.cursor)
                    .cloned(),
            );
        }
        Ok(out)
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<(), StoreError> {
        self.inner.streams.remove(stream_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::TextStreamPart;
    use crate::message::NewMessage;
    use chrono::Utc;

    fn thread(id: &str) -> Thread {
        Thread {
            id: ThreadId::new(id),
            title: None,
            user_id: None,
            created_at: Utc::now(),
        }
    }

    fn doc(thread_id: &str, order: u64, step: u64, status: MessageStatus) -> MessageDoc {
        NewMessage::assistant_text(format!("{order}.{step}"))
            .status(status)
            .into_doc(&ThreadId::new(thread_id), MessageKey::new(order, step))
    }

    async fn seed(store: &MemoryStore, docs: Vec<MessageDoc>) {
        store
            .transact(|tx| {
                tx.insert_thread(thread("t1"))?;
                for d in docs {
                    tx.insert_message(d)?;
                }
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_transaction_leaves_no_writes() {
        let store = MemoryStore::new();
        let result: Result<(), StoreError> = store
            .transact(|tx| {
                tx.insert_thread(thread("t1"))?;
                tx.insert_message(doc("t1", 0, 0, MessageStatus::Success))?;
                Err(StoreError::conflict("boom"))
            })
            .await;
        assert!(result.is_err());
        let found = store
            .transact(|tx| tx.thread(&ThreadId::new("t1")))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_within_and_across_transactions() {
        let store = MemoryStore::new();
        seed(&store, vec![doc("t1", 0, 0, MessageStatus::Success)]).await;
        let err = store
            .transact(|tx| tx.insert_message(doc("t1", 0, 0, MessageStatus::Pending)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn max_key_and_max_step_see_staged_rows() {
        let store = MemoryStore::new();
        seed(
            &store,
            vec![
                doc("t1", 0, 0, MessageStatus::Success),
                doc("t1", 1, 2, MessageStatus::Success),
            ],
        )
        .await;
        let (max, step) = store
            .transact(|tx| {
                tx.insert_message(doc("t1", 1, 3, MessageStatus::Pending))?;
                let t = ThreadId::new("t1");
                Ok::<_, StoreError>((tx.max_key(&t)?, tx.max_step(&t, 1)?))
            })
            .await
            .unwrap();
        assert_eq!(max, Some(MessageKey::new(1, 3)));
        assert_eq!(step, Some(3));
    }

    #[tokio::test]
    async fn scan_filters_partition_and_respects_direction() {
        let store = MemoryStore::new();
        seed(
            &store,
            vec![
                doc("t1", 0, 0, MessageStatus::Success),
                doc("t1", 1, 0, MessageStatus::Failed),
                doc("t1", 2, 0, MessageStatus::Success),
                doc("t1", 3, 0, MessageStatus::Success),
            ],
        )
        .await;
        let mut scan = IndexScan {
            thread_id: ThreadId::new("t1"),
            status: MessageStatus::Success,
            tool: false,
            up_to_and_including: Some(2),
            sort: SortOrder::Desc,
        };
        let page = store.scan(&scan, None, 10).await.unwrap();
        let orders: Vec<u64> = page.messages.iter().map(|m| m.order).collect();
        assert_eq!(orders, vec![2, 0]);
        assert!(!page.has_more);

        scan.sort = SortOrder::Asc;
        scan.up_to_and_including = None;
        let page = store
            .scan(&scan, Some(MessageKey::new(0, 0)), 1)
            .await
            .unwrap();
        assert_eq!(page.messages[0].order, 2);
        assert!(page.has_more);
    }

    fn new_stream() -> NewStream {
        NewStream {
            thread_id: ThreadId::new("t1"),
            order: 1,
            step_order: 0,
            ..NewStream::default()
        }
    }

    fn delta(stream_id: &StreamId, start: u64, text: &str) -> StreamDelta {
        StreamDelta {
            stream_id: stream_id.clone(),
            start,
            end: start + 1,
            parts: vec![TextStreamPart::text(text)],
        }
    }

    #[tokio::test]
    async fn deltas_must_be_contiguous() {
        let store = MemoryStore::new();
        let header = store.create_stream(new_stream()).await.unwrap();
        assert!(store.append_delta(delta(&header.stream_id, 0, "a")).await.unwrap());
        let err = store
            .append_delta(delta(&header.stream_id, 3, "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NonContiguousDelta { expected: 1, .. }));
    }

    #[tokio::test]
    async fn aborted_stream_rejects_deltas() {
        let store = MemoryStore::new();
        let header = store.create_stream(new_stream()).await.unwrap();
        assert!(store.abort_stream(&header.stream_id, "timeout").await.unwrap());
        assert!(!store.append_delta(delta(&header.stream_id, 0, "a")).await.unwrap());
        assert!(!store.abort_stream(&header.stream_id, "again").await.unwrap());
        let listed = store
            .list_streams(&ThreadId::new("t1"), &[StreamStatus::Aborted])
            .await
            .unwrap();
        assert_eq!(listed[0].abort_reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn list_deltas_starts_at_cursor() {
        let store = MemoryStore::new();
        let header = store.create_stream(new_stream()).await.unwrap();
        for (i, text) in ["a", "b", "c"].into_iter().enumerate() {
            store
                .append_delta(delta(&header.stream_id, i as u64, text))
                .await
                .unwrap();
        }
        let deltas = store
            .list_deltas(
                &ThreadId::new("t1"),
                &[StreamCursor {
                    stream_id: header.stream_id.clone(),
                    cursor: 1,
                }],
            )
            .await
            .unwrap();
        let starts: Vec<u64> = deltas.iter().map(|d| d.start).collect();
        assert_eq!(starts, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_stream_is_deleted_after_retention() {
        let store = MemoryStore::with_config(
            MemoryStoreConfig::default().finished_stream_retention(Some(Duration::from_secs(60))),
        );
        let header = store.create_stream(new_stream()).await.unwrap();
        store
            .finish_stream(&header.stream_id, Some(delta(&header.stream_id, 0, "a")))
            .await
            .unwrap();
        let finished = store.stream(&header.stream_id).await.unwrap().unwrap();
        assert_eq!(finished.status, StreamStatus::Finished);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.stream(&header.stream_id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_stream_is_deleted_after_retention() {
        let store = MemoryStore::with_config(
            MemoryStoreConfig::default().finished_stream_retention(Some(Duration::from_secs(60))),
        );
        let header = store.create_stream(new_stream()).await.unwrap();
        assert!(store.abort_stream(&header.stream_id, "cancelled").await.unwrap());

        tokio::time::sleep(Duration::from_secs(30)).await;
        let aborted = store.stream(&header.stream_id).await.unwrap().unwrap();
        assert_eq!(aborted.status, StreamStatus::Aborted);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(store.stream(&header.stream_id).await.unwrap().is_none());
    }
}
