//! Threads, persisted messages and their structured content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, StreamId, ThreadId};

/// Conversation container. Holds no ordering state of its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: ThreadId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Options for creating a thread.
#[derive(Clone, Debug, Default)]
pub struct NewThread {
    pub title: Option<String>,
    pub user_id: Option<String>,
}

impl NewThread {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Author role of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message lifecycle. Only `Pending -> Success` and `Pending -> Failed` are
/// legal transitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Success,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Composite ordering key of a message within its thread.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub order: u64,
    pub step_order: u64,
}

impl MessageKey {
    pub fn new(order: u64, step_order: u64) -> Self {
        Self { order, step_order }
    }

    /// Key for the next visible message after `current` (a new turn).
    pub fn next_turn(current: Option<Self>) -> Self {
        match current {
            Some(key) => Self::new(key.order + 1, 0),
            None => Self::new(0, 0),
        }
    }

    /// Key for the next step inside the turn of `current`.
    pub fn next_step(current: Option<Self>) -> Self {
        match current {
            Some(key) => Self::new(key.order, key.step_order + 1),
            None => Self::new(0, 0),
        }
    }
}

/// Arguments of a tool call: raw JSON text while streaming, a parsed value once
/// the call is complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "kebab-case")]
pub enum ToolCallArgs {
    Streaming(String),
    Complete(serde_json::Value),
}

/// One entry of a message's structured content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: ToolCallArgs,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            args: ToolCallArgs::Complete(args),
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
            is_error: false,
        }
    }

    fn is_tool(&self) -> bool {
        matches!(self, Self::ToolCall { .. } | Self::ToolResult { .. })
    }
}

/// Citation attached to a message outside of its main content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A message row, either persisted or reconstructed from stream deltas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDoc {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub order: u64,
    pub step_order: u64,
    pub tool: bool,
    pub status: MessageStatus,
    pub role: Role,
    pub content: Vec<ContentPart>,
    /// Plain text of all text entries, in order.
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    pub created_at: DateTime<Utc>,
}

impl MessageDoc {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.order, self.step_order)
    }

    /// Replaces the content and refreshes the derived `tool` and `text` fields.
    pub fn set_content(&mut self, content: Vec<ContentPart>) {
        self.content = content;
        self.refresh_derived();
    }

    pub(crate) fn refresh_derived(&mut self) {
        self.tool = is_tool_message(self.role, &self.content);
        self.text = plain_text(&self.content);
    }

    /// Ids of all tool calls in this message's content.
    pub fn tool_call_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
    }

    /// Ids referenced by the tool results in this message's content.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
    }
}

/// True when a message belongs to a tool round-trip rather than being a
/// visible turn of its own.
pub fn is_tool_message(role: Role, content: &[ContentPart]) -> bool {
    role == Role::Tool || content.iter().any(ContentPart::is_tool)
}

fn plain_text(content: &[ContentPart]) -> String {
    let mut out = String::new();
    for part in content {
        if let ContentPart::Text { text } = part {
            out.push_str(text);
        }
    }
    out
}

/// A message to be inserted by the ledger. Order keys are assigned on insert.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
    pub status: MessageStatus,
    pub sources: Vec<Source>,
    pub error: Option<String>,
    pub agent_name: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub user_id: Option<String>,
}

impl NewMessage {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            role,
            content,
            status: MessageStatus::Success,
            sources: Vec::new(),
            error: None,
            agent_name: None,
            model: None,
            provider: None,
            user_id: None,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    pub fn status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    pub fn agent_name(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn is_tool(&self) -> bool {
        is_tool_message(self.role, &self.content)
    }

    pub(crate) fn into_doc(self, thread_id: &ThreadId, key: MessageKey) -> MessageDoc {
        let mut doc = MessageDoc {
            id: MessageId::generate(),
            thread_id: thread_id.clone(),
            order: key.order,
            step_order: key.step_order,
            tool: false,
            status: self.status,
            role: self.role,
            content: self.content,
            text: String::new(),
            sources: self.sources,
            error: self.error,
            agent_name: self.agent_name,
            model: self.model,
            provider: self.provider,
            user_id: self.user_id,
            stream_id: None,
            created_at: Utc::now(),
        };
        doc.refresh_derived();
        doc
    }
}
