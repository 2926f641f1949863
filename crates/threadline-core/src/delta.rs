//! Wire types for in-flight generations: stream headers, delta rows and the
//! parts they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{StreamId, ThreadId};
use crate::message::{MessageKey, MessageStatus, Source};

/// One incremental piece of generation output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TextStreamPart {
    TextDelta {
        text_delta: String,
    },
    Reasoning {
        text_delta: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolCallStreamingStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolCallDelta {
        tool_call_id: String,
        tool_name: String,
        args_text_delta: String,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Source(Source),
}

impl TextStreamPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta {
            text_delta: text.into(),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning {
            text_delta: text.into(),
        }
    }

    pub fn tool_call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            args,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: serde_json::Value,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            result,
            is_error: None,
        }
    }

    /// Parts that belong in a tool-role message.
    pub fn is_tool_role(&self) -> bool {
        matches!(self, Self::Source(_) | Self::ToolResult { .. })
    }
}

/// A contiguous slice `[start, end)` of a stream's part log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDelta {
    pub stream_id: StreamId,
    pub start: u64,
    pub end: u64,
    pub parts: Vec<TextStreamPart>,
}

/// Lifecycle of a stream header.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Streaming,
    Finished,
    Aborted,
}

impl StreamStatus {
    /// Status carried by messages reconstructed from a stream in this state.
    pub fn message_status(self) -> MessageStatus {
        match self {
            Self::Streaming => MessageStatus::Pending,
            Self::Finished => MessageStatus::Success,
            Self::Aborted => MessageStatus::Failed,
        }
    }
}

/// Caller metadata used to open a stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewStream {
    pub thread_id: ThreadId,
    pub order: u64,
    pub step_order: u64,
    pub agent_name: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub user_id: Option<String>,
}

/// Describes one generation and the slot its output will occupy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHeader {
    pub stream_id: StreamId,
    pub thread_id: ThreadId,
    pub order: u64,
    pub step_order: u64,
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StreamHeader {
    pub fn from_new(stream_id: StreamId, stream: NewStream) -> Self {
        Self {
            stream_id,
            thread_id: stream.thread_id,
            order: stream.order,
            step_order: stream.step_order,
            status: StreamStatus::Streaming,
            agent_name: stream.agent_name,
            model: stream.model,
            provider: stream.provider,
            user_id: stream.user_id,
            abort_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.order, self.step_order)
    }
}

/// Read position of a reader inside one stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCursor {
    pub stream_id: StreamId,
    pub cursor: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_wire_format_round_trips_exactly() {
        let wire = json!({
            "streamId": "s1",
            "start": 0,
            "end": 4,
            "parts": [
                {"type": "text-delta", "textDelta": "Hi"},
                {"type": "tool-call-streaming-start", "toolCallId": "c1", "toolName": "search"},
                {"type": "tool-call-delta", "toolCallId": "c1", "toolName": "search", "argsTextDelta": "{\"q\":"},
                {"type": "source", "id": "src1", "sourceType": "url", "url": "https://example.com"}
            ]
        });
        let delta: StreamDelta = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(delta.end, 4);
        assert!(matches!(
            delta.parts[1],
            TextStreamPart::ToolCallStreamingStart { .. }
        ));
        assert_eq!(serde_json::to_value(&delta).unwrap(), wire);
    }

    #[test]
    fn tool_role_parts_are_results_and_sources() {
        assert!(TextStreamPart::tool_result("c", "t", json!(null)).is_tool_role());
        assert!(!TextStreamPart::tool_call("c", "t", json!({})).is_tool_role());
        assert!(!TextStreamPart::text("x").is_tool_role());
    }

    #[test]
    fn new_stream_defaults_to_first_slot() {
        let stream = NewStream {
            thread_id: ThreadId::new("t1"),
            ..NewStream::default()
        };
        assert_eq!((stream.order, stream.step_order), (0, 0));
        assert!(stream.agent_name.is_none());
    }

    #[test]
    fn stream_status_maps_to_message_status() {
        assert_eq!(
            StreamStatus::Streaming.message_status(),
            MessageStatus::Pending
        );
        assert_eq!(StreamStatus::Aborted.message_status(), MessageStatus::Failed);
    }
}
