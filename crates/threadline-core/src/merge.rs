//! Reconstruction of pending messages from stream deltas.
//!
//! Every function here is pure: inputs are borrowed, outputs are fresh values.
//! A reader keeps the returned [`StreamState`]s and feeds them back on the next
//! poll together with whatever deltas it fetched. Deltas may arrive duplicated,
//! out of order or with holes; the cursor comparison below absorbs all of that
//! so that re-applying a delta set never changes the result.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::delta::{StreamDelta, StreamHeader, StreamStatus, TextStreamPart};
use crate::error::MergeError;
use crate::ids::{MessageId, StreamId, ThreadId};
use crate::message::{ContentPart, MessageDoc, Role, ToolCallArgs};

/// Per-stream reconstruction state carried between polls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    pub stream_id: StreamId,
    /// End of the last consumed delta.
    pub cursor: u64,
    pub status: StreamStatus,
    pub messages: Vec<MessageDoc>,
}

impl StreamState {
    fn empty(header: &StreamHeader) -> Self {
        Self {
            stream_id: header.stream_id.clone(),
            cursor: 0,
            status: header.status,
            messages: Vec::new(),
        }
    }
}

/// Result of merging all active streams of a thread.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeOutput {
    /// Reconstructed messages sorted by `(order, stepOrder)`.
    pub messages: Vec<MessageDoc>,
    /// New per-stream state, one entry per header, in header order.
    pub streams: Vec<Arc<StreamState>>,
    pub changed: bool,
}

/// Merges the deltas of every stream in `headers` on top of `prior` state.
///
/// Prior states whose header is gone (stream finished or aborted and no longer
/// listed) are dropped and reported as a change.
pub fn merge_deltas(
    thread_id: &ThreadId,
    headers: &[StreamHeader],
    prior: &[Arc<StreamState>],
    deltas: &[StreamDelta],
) -> Result<MergeOutput, MergeError> {
    let mut streams = Vec::with_capacity(headers.len());
    let mut changed = false;
    for header in headers {
        let existing = prior.iter().find(|s| s.stream_id == header.stream_id);
        let (state, stream_changed) =
            apply_deltas_to_stream_message(thread_id, header, existing, deltas)?;
        changed |= stream_changed;
        streams.push(state);
    }

    for state in prior {
        if !headers.iter().any(|h| h.stream_id == state.stream_id) {
            debug!(stream_id = %state.stream_id, "stream no longer active");
            changed = true;
        }
    }

    let mut messages: Vec<MessageDoc> = streams
        .iter()
        .flat_map(|s| s.messages.iter().cloned())
        .collect();
    messages.sort_by_key(MessageDoc::key);

    Ok(MergeOutput {
        messages,
        streams,
        changed,
    })
}

/// Applies the deltas belonging to one stream on top of its prior state.
///
/// When nothing advances the cursor the prior `Arc` is returned as-is, so
/// callers can detect "no change" by pointer as well as by the flag.
pub fn apply_deltas_to_stream_message(
    thread_id: &ThreadId,
    header: &StreamHeader,
    prior: Option<&Arc<StreamState>>,
    deltas: &[StreamDelta],
) -> Result<(Arc<StreamState>, bool), MergeError> {
    let mut own: Vec<&StreamDelta> = deltas
        .iter()
        .filter(|d| d.stream_id == header.stream_id)
        .collect();
    own.sort_by_key(|d| d.start);

    let mut cursor = prior.map_or(0, |s| s.cursor);
    let mut parts: Vec<&TextStreamPart> = Vec::new();
    for delta in own {
        if delta.parts.is_empty() {
            debug!(stream_id = %header.stream_id, start = delta.start, "skipping empty delta");
            continue;
        }
        if cursor == delta.start {
            parts.extend(delta.parts.iter());
            cursor = delta.end;
        } else if cursor >= delta.end {
            continue;
        } else if cursor < delta.start {
            warn!(
                stream_id = %header.stream_id,
                cursor,
                start = delta.start,
                "gap in stream deltas, waiting for missing range"
            );
        } else {
            return Err(MergeError::MisalignedDelta {
                stream_id: header.stream_id.clone(),
                start: delta.start,
                end: delta.end,
                cursor,
            });
        }
    }

    if parts.is_empty() {
        return Ok(match prior {
            Some(state) if state.status == header.status => (Arc::clone(state), false),
            Some(state) => {
                let mut restamped = StreamState::clone(state);
                restamp(&mut restamped, header);
                (Arc::new(restamped), true)
            }
            None => (Arc::new(StreamState::empty(header)), false),
        });
    }

    let mut state = match prior {
        Some(state) => StreamState::clone(state),
        None => StreamState::empty(header),
    };
    state.cursor = cursor;
    for part in parts {
        apply_part(thread_id, header, &mut state.messages, part);
    }
    restamp(&mut state, header);
    Ok((Arc::new(state), true))
}

fn restamp(state: &mut StreamState, header: &StreamHeader) {
    state.status = header.status;
    let status = header.status.message_status();
    for message in &mut state.messages {
        message.status = status;
        message.error = header.abort_reason.clone();
    }
}

fn apply_part(
    thread_id: &ThreadId,
    header: &StreamHeader,
    messages: &mut Vec<MessageDoc>,
    part: &TextStreamPart,
) {
    let tool_role = part.is_tool_role();
    if messages
        .last()
        .is_none_or(|m| (m.role == Role::Tool) != tool_role)
    {
        let role = if tool_role {
            Role::Tool
        } else {
            Role::Assistant
        };
        let message = synthesize_message(thread_id, header, messages.len(), role);
        messages.push(message);
    }
    let Some(message) = messages.last_mut() else {
        return;
    };
    merge_part(message, part);
}

fn synthesize_message(
    thread_id: &ThreadId,
    header: &StreamHeader,
    index: usize,
    role: Role,
) -> MessageDoc {
    MessageDoc {
        id: MessageId::new(format!("{}-{}", header.stream_id, index)),
        thread_id: thread_id.clone(),
        order: header.order,
        step_order: header.step_order + index as u64,
        tool: role == Role::Tool,
        status: header.status.message_status(),
        role,
        content: Vec::new(),
        text: String::new(),
        sources: Vec::new(),
        error: header.abort_reason.clone(),
        agent_name: header.agent_name.clone(),
        model: header.model.clone(),
        provider: header.provider.clone(),
        user_id: header.user_id.clone(),
        stream_id: Some(header.stream_id.clone()),
        created_at: header.created_at,
    }
}

fn merge_part(message: &mut MessageDoc, part: &TextStreamPart) {
    match part {
        TextStreamPart::TextDelta { text_delta } => {
            if let Some(ContentPart::Text { text }) = message.content.last_mut() {
                text.push_str(text_delta);
            } else {
                message.content.push(ContentPart::text(text_delta.clone()));
            }
            message.text.push_str(text_delta);
        }
        TextStreamPart::Reasoning { text_delta } => {
            if let Some(ContentPart::Reasoning { text }) = message.content.last_mut() {
                text.push_str(text_delta);
            } else {
                message.content.push(ContentPart::Reasoning {
                    text: text_delta.clone(),
                });
            }
        }
        TextStreamPart::ToolCallStreamingStart {
            tool_call_id,
            tool_name,
        } => {
            message.content.push(ContentPart::ToolCall {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                args: ToolCallArgs::Streaming(String::new()),
            });
        }
        TextStreamPart::ToolCallDelta {
            tool_call_id,
            tool_name,
            args_text_delta,
        } => match streaming_args(&mut message.content, tool_call_id) {
            Some(args) => args.push_str(args_text_delta),
            None => {
                warn!(
                    message_id = %message.id,
                    tool_call_id = %tool_call_id,
                    "tool-call-delta does not follow its streaming tool call, starting one"
                );
                message.content.push(ContentPart::ToolCall {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    args: ToolCallArgs::Streaming(args_text_delta.clone()),
                });
            }
        },
        TextStreamPart::ToolCall {
            tool_call_id,
            tool_name,
            args,
        } => {
            let in_progress = message.content.iter_mut().rev().find_map(|entry| match entry {
                ContentPart::ToolCall {
                    tool_call_id: id,
                    args: args_slot @ ToolCallArgs::Streaming(_),
                    ..
                } if id == tool_call_id => Some(args_slot),
                _ => None,
            });
            match in_progress {
                Some(slot) => *slot = ToolCallArgs::Complete(args.clone()),
                None => message
                    .content
                    .push(ContentPart::tool_call(tool_call_id.clone(), tool_name.clone(), args.clone())),
            }
        }
        TextStreamPart::ToolResult {
            tool_call_id,
            tool_name,
            result,
            is_error,
        } => {
            message.content.push(ContentPart::ToolResult {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                result: result.clone(),
                is_error: is_error.unwrap_or(false),
            });
        }
        TextStreamPart::Source(source) => message.sources.push(source.clone()),
    }
    if !message.tool {
        message.tool = matches!(
            message.content.last(),
            Some(ContentPart::ToolCall { .. } | ContentPart::ToolResult { .. })
        );
    }
}

/// Finds the streaming argument buffer of an in-progress tool call.
/// Args of the trailing entry, if it is the in-progress call `tool_call_id`.
fn streaming_args<'a>(content: &'a mut [ContentPart], tool_call_id: &str) -> Option<&'a mut String> {
    match content.last_mut()? {
        ContentPart::ToolCall {
            tool_call_id: id,
            args: ToolCallArgs::Streaming(args),
            ..
        } if id == tool_call_id => Some(args),
        _ => None,
    }
}
