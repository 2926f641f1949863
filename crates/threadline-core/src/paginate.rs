//! K-way merge of several ordered index scans into one paginated stream.
//!
//! Every source is an independent scan sorted in the same direction. A page is
//! built by repeatedly taking the best head across sources. The continuation
//! cursor records, per source, the key of the last row consumed from it, so
//! the next page resumes every scan exactly where it stopped.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::message::{MessageDoc, MessageKey};
use crate::store::{IndexScan, MessageStore, SortOrder};

/// An ordered, resumable scan.
#[async_trait]
pub trait PageSource: Send {
    type Item: Send;
    type Key: Ord + Clone + Send + Sync + Serialize + DeserializeOwned;

    fn key(item: &Self::Item) -> Self::Key;

    /// Up to `limit` items strictly past `after`, plus whether more remain.
    async fn fetch(
        &mut self,
        after: Option<Self::Key>,
        limit: usize,
    ) -> Result<(Vec<Self::Item>, bool), StoreError>;
}

/// One page of merged output.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedPage<T> {
    pub items: Vec<T>,
    pub continue_cursor: String,
    pub is_done: bool,
}

struct SourceState<S: PageSource> {
    source: S,
    buffer: VecDeque<S::Item>,
    position: Option<S::Key>,
    has_more: bool,
}

impl<S: PageSource> SourceState<S> {
    async fn refill(&mut self, limit: usize) -> Result<(), StoreError> {
        let (items, has_more) = self.source.fetch(self.position.clone(), limit).await?;
        self.buffer.extend(items);
        self.has_more = has_more;
        Ok(())
    }

    fn head_key(&self) -> Option<S::Key> {
        self.buffer.front().map(S::key)
    }
}

fn encode_cursor<K: Serialize>(positions: &[Option<K>]) -> Result<String, StoreError> {
    serde_json::to_string(positions).map_err(|err| StoreError::Backend(err.to_string()))
}

fn decode_cursor<K: DeserializeOwned>(
    cursor: &str,
    sources: usize,
) -> Result<Vec<Option<K>>, StoreError> {
    let positions: Vec<Option<K>> = serde_json::from_str(cursor)
        .map_err(|err| StoreError::invalid_cursor(err.to_string()))?;
    if positions.len() != sources {
        return Err(StoreError::invalid_cursor(format!(
            "cursor holds {} positions, expected {sources}",
            positions.len()
        )));
    }
    Ok(positions)
}

/// Reads one page of up to `limit` items merged across `sources`.
///
/// `cursor` must come from a previous call with the same sources in the same
/// order and the same `sort`.
pub async fn merged_page<S: PageSource>(
    sources: Vec<S>,
    sort: SortOrder,
    cursor: Option<&str>,
    limit: usize,
) -> Result<MergedPage<S::Item>, StoreError> {
    let positions = match cursor {
        Some(raw) => decode_cursor::<S::Key>(raw, sources.len())?,
        None => vec![None; sources.len()],
    };
    let mut states: Vec<SourceState<S>> = sources
        .into_iter()
        .zip(positions)
        .map(|(source, position)| SourceState {
            source,
            buffer: VecDeque::new(),
            position,
            has_more: true,
        })
        .collect();

    try_join_all(states.iter_mut().map(|state| state.refill(limit))).await?;

    let mut items = Vec::with_capacity(limit);
    while items.len() < limit {
        let best = states
            .iter()
            .enumerate()
            .filter_map(|(index, state)| state.head_key().map(|key| (index, key)))
            .reduce(|best, candidate| {
                let better = match sort {
                    SortOrder::Asc => candidate.1 < best.1,
                    SortOrder::Desc => candidate.1 > best.1,
                };
                if better { candidate } else { best }
            });
        let Some((index, key)) = best else {
            break;
        };
        let state = &mut states[index];
        if let Some(item) = state.buffer.pop_front() {
            items.push(item);
        }
        state.position = Some(key);
        if state.buffer.is_empty() && state.has_more {
            state.refill(limit).await?;
        }
    }

    let is_done = states
        .iter()
        .all(|state| state.buffer.is_empty() && !state.has_more);
    let positions: Vec<Option<S::Key>> = states.into_iter().map(|state| state.position).collect();
    Ok(MergedPage {
        items,
        continue_cursor: encode_cursor(&positions)?,
        is_done,
    })
}

/// Adapts one partition of the message index to [`PageSource`].
pub struct PartitionScan<'a, S> {
    store: &'a S,
    scan: IndexScan,
}

impl<'a, S: MessageStore> PartitionScan<'a, S> {
    pub fn new(store: &'a S, scan: IndexScan) -> Self {
        Self { store, scan }
    }
}

#[async_trait]
impl<'a, S: MessageStore> PageSource for PartitionScan<'a, S> {
    type Item = MessageDoc;
    type Key = MessageKey;

    fn key(item: &MessageDoc) -> MessageKey {
        item.key()
    }

    async fn fetch(
        &mut self,
        after: Option<MessageKey>,
        limit: usize,
    ) -> Result<(Vec<MessageDoc>, bool), StoreError> {
        let page = self.store.scan(&self.scan, after, limit).await?;
        Ok((page.messages, page.has_more))
    }
}
