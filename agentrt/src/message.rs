//! Message types for the agent conversation log.
//!
//! This module defines the tagged-variant message format for the agent
//! log's data model: a [`Message`] is one of `system | user | assistant | tool`,
//! assistant content is an ordered sequence of [`AssistantPart`]s, and tool
//! output is an ordered sequence of typed [`OutputPart`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unique identifier for a tool call, assigned by the stream parser at
/// parse time and referenced forever afterward by the message log.
pub type ToolCallId = String;

/// One message in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    /// System message providing instructions.
    System {
        /// The instruction text.
        text: String,
    },
    /// User message, including synthetic error messages appended by the
    /// dispatcher (see [`crate::log::MessageLog::append_user_error`]).
    User {
        /// The message text.
        text: String,
    },
    /// Assistant (model) message: an ordered sequence of text and tool-call
    /// parts.
    Assistant {
        /// The ordered parts that make up this message.
        parts: Vec<AssistantPart>,
    },
    /// Tool result message, paired with exactly one preceding assistant
    /// `tool-call` part (the pairing invariant).
    Tool {
        /// The id of the tool call this result answers.
        tool_call_id: ToolCallId,
        /// The name of the tool that was called.
        tool_name: String,
        /// The tool's output.
        output: Vec<OutputPart>,
    },
}

impl Message {
    /// Construct a system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { text: text.into() }
    }

    /// Construct a user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }

    /// Construct an assistant message from parts.
    #[must_use]
    pub const fn assistant(parts: Vec<AssistantPart>) -> Self {
        Self::Assistant { parts }
    }

    /// Construct a tool result message.
    #[must_use]
    pub fn tool(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: Vec<OutputPart>,
    ) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output,
        }
    }

    /// The tool-call ids this message introduces, if it is an assistant
    /// message with tool-call parts.
    #[must_use]
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match self {
            Self::Assistant { parts } => parts
                .iter()
                .filter_map(|p| match p {
                    AssistantPart::ToolCall { id, .. } => Some(id.as_str()),
                    AssistantPart::Text { .. } => None,
                })
                .collect(),
            Self::System { .. } | Self::User { .. } | Self::Tool { .. } => Vec::new(),
        }
    }

    /// The tool-call id this message answers, if it is a tool message.
    #[must_use]
    pub fn answered_tool_call_id(&self) -> Option<&str> {
        match self {
            Self::Tool { tool_call_id, .. } => Some(tool_call_id.as_str()),
            Self::System { .. } | Self::User { .. } | Self::Assistant { .. } => None,
        }
    }

    /// Concatenate the text parts of an assistant message, or `None` for
    /// other roles.
    #[must_use]
    pub fn assistant_text(&self) -> Option<String> {
        match self {
            Self::Assistant { parts } => {
                let text: String = parts
                    .iter()
                    .filter_map(AssistantPart::as_text)
                    .collect::<Vec<_>>()
                    .join("");
                Some(text)
            }
            Self::System { .. } | Self::User { .. } | Self::Tool { .. } => None,
        }
    }

    /// Append an interruption marker to the last text part of an assistant
    /// message (or push a new text part if there is none), used when a step
    /// is aborted mid-stream.
    pub fn append_interruption_marker(&mut self) {
        const MARKER: &str = "\n[Request interrupted by user]";
        if let Self::Assistant { parts } = self {
            if let Some(AssistantPart::Text { text }) =
                parts.iter_mut().rev().find(|p| matches!(p, AssistantPart::Text { .. }))
            {
                text.push_str(MARKER);
            } else {
                parts.push(AssistantPart::Text {
                    text: MARKER.trim_start().to_owned(),
                });
            }
        }
    }
}

/// One part of an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AssistantPart {
    /// Plain text content.
    Text {
        /// The text content.
        text: String,
    },
    /// A model-requested tool invocation.
    #[serde(rename = "tool-call")]
    ToolCall {
        /// Process-unique id assigned at parse time.
        id: ToolCallId,
        /// The tool's name as emitted by the model.
        name: String,
        /// The tool's input arguments.
        input: Value,
    },
}

impl AssistantPart {
    /// Build a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Build a tool-call part.
    #[must_use]
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    /// Borrow the text, if this is a text part.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text.as_str()),
            Self::ToolCall { .. } => None,
        }
    }
}

/// One typed part of a tool's output.
///
/// Wire schema: `{"type": "text"|"json"|"error-text"|"error-json"|"media",
/// "value": any}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutputPart {
    /// Plain text output.
    Text {
        /// The text value.
        value: String,
    },
    /// Structured JSON output.
    Json {
        /// The JSON value.
        value: Value,
    },
    /// An error rendered as text.
    ErrorText {
        /// The error text.
        value: String,
    },
    /// An error rendered as structured JSON.
    ErrorJson {
        /// The error JSON value.
        value: Value,
    },
    /// Inline media (e.g. a screenshot), as a base64-encoded payload with a
    /// MIME type.
    Media {
        /// The media payload.
        value: MediaValue,
    },
}

/// A base64-encoded media payload attached to a tool output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaValue {
    /// IANA media type, e.g. `image/png`.
    pub mime_type: String,
    /// Base64-encoded bytes.
    pub data_base64: String,
}

impl OutputPart {
    /// Build a text output part.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text { value: value.into() }
    }

    /// Build a JSON output part.
    #[must_use]
    pub const fn json(value: Value) -> Self {
        Self::Json { value }
    }

    /// Build an error-text output part.
    #[must_use]
    pub fn error_text(value: impl Into<String>) -> Self {
        Self::ErrorText { value: value.into() }
    }

    /// Build an error-json output part.
    #[must_use]
    pub const fn error_json(value: Value) -> Self {
        Self::ErrorJson { value }
    }

    /// Whether this part represents a handler-reported error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::ErrorText { .. } | Self::ErrorJson { .. })
    }
}

/// Encode raw bytes as a base64 media value.
#[must_use]
pub fn media_from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> MediaValue {
    use base64::Engine as _;
    MediaValue {
        mime_type: mime_type.into(),
        data_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_ids_collects_only_tool_call_parts() {
        let msg = Message::assistant(vec![
            AssistantPart::text("ok: "),
            AssistantPart::tool_call("tc_1", "read_files", serde_json::json!({})),
        ]);
        assert_eq!(msg.tool_call_ids(), vec!["tc_1"]);
    }

    #[test]
    fn append_interruption_marker_extends_last_text_part() {
        let mut msg = Message::assistant(vec![AssistantPart::text("partial")]);
        msg.append_interruption_marker();
        assert_eq!(
            msg.assistant_text().unwrap(),
            "partial\n[Request interrupted by user]"
        );
    }

    #[test]
    fn append_interruption_marker_on_empty_assistant_message() {
        let mut msg = Message::assistant(vec![]);
        msg.append_interruption_marker();
        assert_eq!(msg.assistant_text().unwrap(), "[Request interrupted by user]");
    }

    #[test]
    fn round_trips_through_json() {
        let msg = Message::tool(
            "tc_1",
            "read_files",
            vec![OutputPart::json(serde_json::json!({"a.ts": "x"}))],
        );
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: Message = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.answered_tool_call_id(), Some("tc_1"));
    }
}
