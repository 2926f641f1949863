//! Order and step assignment for persisted messages.
//!
//! `order` groups one visible turn; `stepOrder` counts the tool round-trips
//! chained under it. Every mutation reads the current maximum and inserts in
//! the same store transaction, so two writers on one thread never share a slot.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::ids::{MessageId, ThreadId};
use crate::message::{
    ContentPart, MessageDoc, MessageKey, MessageStatus, NewMessage, NewThread, Role, Thread,
};
use crate::paginate::{PartitionScan, merged_page};
use crate::store::{IndexScan, MessageStore, MessageTxn, SortOrder};

/// Flags for [`MessageLedger::add_messages`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddMessagesOptions {
    /// Reserve the next turn with an empty pending assistant message.
    pub add_pending: bool,
    /// Fail every pending message of the thread before inserting.
    pub fail_pending_steps: bool,
}

impl AddMessagesOptions {
    pub fn add_pending(mut self, yes: bool) -> Self {
        self.add_pending = yes;
        self
    }

    pub fn fail_pending_steps(mut self, yes: bool) -> Self {
        self.fail_pending_steps = yes;
        self
    }
}

/// Result of [`MessageLedger::add_messages`].
#[derive(Clone, Debug, PartialEq)]
pub struct AddedMessages {
    pub messages: Vec<MessageDoc>,
    pub pending: Option<MessageDoc>,
}

/// Which messages [`MessageLedger::get_chat_messages`] returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageFilters {
    pub statuses: Vec<MessageStatus>,
    pub exclude_tool_messages: bool,
    pub up_to_and_including: Option<u64>,
    pub sort: SortOrder,
}

impl Default for MessageFilters {
    fn default() -> Self {
        Self {
            statuses: vec![MessageStatus::Success],
            exclude_tool_messages: false,
            up_to_and_including: None,
            sort: SortOrder::Desc,
        }
    }
}

impl MessageFilters {
    pub fn statuses(mut self, statuses: impl Into<Vec<MessageStatus>>) -> Self {
        self.statuses = statuses.into();
        self
    }

    pub fn exclude_tool_messages(mut self, yes: bool) -> Self {
        self.exclude_tool_messages = yes;
        self
    }

    pub fn up_to_and_including(mut self, order: u64) -> Self {
        self.up_to_and_including = Some(order);
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaginationOpts {
    /// Opaque cursor returned by a previous page.
    pub cursor: Option<String>,
    pub num_items: Option<usize>,
}

impl PaginationOpts {
    pub fn first(num_items: usize) -> Self {
        Self {
            cursor: None,
            num_items: Some(num_items),
        }
    }

    pub fn after(cursor: impl Into<String>, num_items: usize) -> Self {
        Self {
            cursor: Some(cursor.into()),
            num_items: Some(num_items),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<MessageDoc>,
    pub continue_cursor: String,
    pub is_done: bool,
}

const SUPERSEDED: &str = "superseded by a newer generation";

/// Transactional owner of message order keys.
pub struct MessageLedger<S> {
    store: Arc<S>,
    config: LedgerConfig,
}

impl<S> Clone for MessageLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: MessageStore> MessageLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Runs `f` in a transaction, retrying when the store reports a conflict.
    async fn transact_with_retry<T, F>(&self, op: &'static str, f: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: Fn(&mut dyn MessageTxn) -> Result<T, LedgerError> + Send + Sync,
    {
        let attempts = self.config.max_transaction_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.transact(|tx| f(tx)).await {
                Err(LedgerError::Store(err)) if err.is_conflict() && attempt < attempts => {
                    warn!(op, attempt, error = %err, "transaction conflict, retrying");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    pub async fn create_thread(&self, thread: NewThread) -> Result<Thread, LedgerError> {
        let thread = Thread {
            id: ThreadId::generate(),
            title: thread.title,
            user_id: thread.user_id,
            created_at: Utc::now(),
        };
        self.transact_with_retry("create_thread", |tx| {
            tx.insert_thread(thread.clone())?;
            Ok(())
        })
        .await?;
        debug!(thread_id = %thread.id, "created thread");
        Ok(thread)
    }

    pub async fn get_thread(&self, thread_id: &ThreadId) -> Result<Thread, LedgerError> {
        self.store
            .thread(thread_id)
            .await?
            .ok_or_else(|| LedgerError::ThreadNotFound(thread_id.clone()))
    }

    /// Appends a batch to the thread, assigning keys in insertion order.
    ///
    /// Non-tool messages open a new turn each; tool messages join the turn
    /// in progress as its next step.
    pub async fn add_messages(
        &self,
        thread_id: &ThreadId,
        messages: Vec<NewMessage>,
        options: AddMessagesOptions,
    ) -> Result<AddedMessages, LedgerError> {
        let added = self
            .transact_with_retry("add_messages", |tx| {
                require_thread(tx, thread_id)?;
                if options.fail_pending_steps {
                    fail_pending(tx, thread_id, SUPERSEDED, |_| true)?;
                }

                let mut current = tx.max_key(thread_id)?;
                let mut inserted = Vec::with_capacity(messages.len());
                for message in &messages {
                    let key = if message.is_tool() {
                        MessageKey::next_step(current)
                    } else {
                        MessageKey::next_turn(current)
                    };
                    let doc = message.clone().into_doc(thread_id, key);
                    tx.insert_message(doc.clone())?;
                    inserted.push(doc);
                    current = Some(key);
                }

                let pending = if options.add_pending {
                    let mut placeholder =
                        NewMessage::new(Role::Assistant, Vec::new()).status(MessageStatus::Pending);
                    placeholder.user_id = messages.last().and_then(|m| m.user_id.clone());
                    let doc = placeholder.into_doc(thread_id, MessageKey::next_turn(current));
                    tx.insert_message(doc.clone())?;
                    Some(doc)
                } else {
                    None
                };

                Ok(AddedMessages {
                    messages: inserted,
                    pending,
                })
            })
            .await?;
        debug!(
            thread_id = %thread_id,
            count = added.messages.len(),
            pending = added.pending.is_some(),
            "added messages"
        );
        Ok(added)
    }

    /// Fills a pending message and marks it successful.
    pub async fn update_message(
        &self,
        id: &MessageId,
        content: Vec<ContentPart>,
    ) -> Result<MessageDoc, LedgerError> {
        self.transact_with_retry("update_message", |tx| {
            let mut message = require_pending(tx, id)?;
            message.set_content(content.clone());
            message.status = MessageStatus::Success;
            tx.replace_message(message.clone())?;
            Ok(message)
        })
        .await
    }

    /// Marks a pending message failed.
    pub async fn fail_message(
        &self,
        id: &MessageId,
        error: impl Into<String>,
    ) -> Result<MessageDoc, LedgerError> {
        let error = error.into();
        self.transact_with_retry("fail_message", |tx| {
            let mut message = require_pending(tx, id)?;
            message.status = MessageStatus::Failed;
            message.error = Some(error.clone());
            tx.replace_message(message.clone())?;
            Ok(message)
        })
        .await
    }

    /// Chains `steps` under the turn of `parent_id`, after its highest step.
    ///
    /// With `fail_previous_steps`, pending steps recorded after the parent in
    /// the same turn are failed first.
    pub async fn add_steps(
        &self,
        parent_id: &MessageId,
        steps: Vec<NewMessage>,
        fail_previous_steps: bool,
    ) -> Result<Vec<MessageDoc>, LedgerError> {
        if steps.is_empty() {
            return Err(LedgerError::Validation("add_steps needs at least one step".into()));
        }
        self.transact_with_retry("add_steps", |tx| {
            let parent = tx
                .message(parent_id)?
                .ok_or_else(|| LedgerError::MessageNotFound(parent_id.clone()))?;
            let thread_id = parent.thread_id.clone();
            if fail_previous_steps {
                fail_pending(tx, &thread_id, SUPERSEDED, |m| {
                    m.order == parent.order && m.step_order > parent.step_order
                })?;
            }

            let mut next = tx
                .max_step(&thread_id, parent.order)?
                .map_or(parent.step_order, |max| max.max(parent.step_order))
                + 1;
            let mut inserted = Vec::with_capacity(steps.len());
            for step in &steps {
                let doc = step
                    .clone()
                    .into_doc(&thread_id, MessageKey::new(parent.order, next));
                tx.insert_message(doc.clone())?;
                inserted.push(doc);
                next += 1;
            }
            Ok(inserted)
        })
        .await
    }

    /// One page of the thread's messages, merged across status and kind
    /// partitions into a single `(order, stepOrder)` sequence.
    pub async fn get_chat_messages(
        &self,
        thread_id: &ThreadId,
        filters: &MessageFilters,
        pagination: &PaginationOpts,
    ) -> Result<MessagePage, LedgerError> {
        if filters.statuses.is_empty() {
            return Err(LedgerError::Validation(
                "at least one message status is required".into(),
            ));
        }
        self.get_thread(thread_id).await?;

        let mut statuses: Vec<MessageStatus> = Vec::with_capacity(filters.statuses.len());
        for status in &filters.statuses {
            if !statuses.contains(status) {
                statuses.push(*status);
            }
        }
        let kinds: &[bool] = if filters.exclude_tool_messages {
            &[false]
        } else {
            &[false, true]
        };
        let mut sources = Vec::with_capacity(statuses.len() * kinds.len());
        for status in statuses {
            for &tool in kinds {
                sources.push(PartitionScan::new(
                    self.store.as_ref(),
                    IndexScan {
                        thread_id: thread_id.clone(),
                        status,
                        tool,
                        up_to_and_including: filters.up_to_and_including,
                        sort: filters.sort,
                    },
                ));
            }
        }

        let limit = self.config.page_size(pagination.num_items);
        let page = merged_page(sources, filters.sort, pagination.cursor.as_deref(), limit).await?;
        Ok(MessagePage {
            messages: page.items,
            continue_cursor: page.continue_cursor,
            is_done: page.is_done,
        })
    }
}

fn require_thread(tx: &mut dyn MessageTxn, thread_id: &ThreadId) -> Result<Thread, LedgerError> {
    tx.thread(thread_id)?
        .ok_or_else(|| LedgerError::ThreadNotFound(thread_id.clone()))
}

fn require_pending(tx: &mut dyn MessageTxn, id: &MessageId) -> Result<MessageDoc, LedgerError> {
    let message = tx
        .message(id)?
        .ok_or_else(|| LedgerError::MessageNotFound(id.clone()))?;
    if message.status.is_terminal() {
        return Err(LedgerError::InvalidTransition {
            id: id.clone(),
            from: message.status,
        });
    }
    Ok(message)
}

fn fail_pending(
    tx: &mut dyn MessageTxn,
    thread_id: &ThreadId,
    error: &str,
    mut keep: impl FnMut(&MessageDoc) -> bool,
) -> Result<usize, LedgerError> {
    let mut failed = 0;
    for mut message in tx.messages_with_status(thread_id, MessageStatus::Pending)? {
        if !keep(&message) {
            continue;
        }
        message.status = MessageStatus::Failed;
        message.error = Some(error.to_string());
        tx.replace_message(message)?;
        failed += 1;
    }
    if failed > 0 {
        debug!(thread_id = %thread_id, failed, "failed pending messages");
    }
    Ok(failed)
}
