//! The message log (component C1).
//!
//! Append-only during a step, with a single transactional rewrite
//! (`commit`) at step end. `commit` is the only place the ordering
//! guaranteed by the pairing and adjacency invariants is enforced: it
//! reassembles `snapshot ++ assistantParts ++ tool-call-parts-as-assistant
//! ++ toolResults ++ userErrors` regardless of the order in which async
//! tool handlers actually resolved.

use crate::error::{AgentError, Result};
use crate::message::{AssistantPart, Message, OutputPart, ToolCallId};

/// An immutable prefix of the conversation log, captured at step start.
pub type History = Vec<Message>;

/// A recorded tool-call part awaiting commit.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    /// The tool-call id.
    pub id: ToolCallId,
    /// The tool name.
    pub name: String,
    /// The tool's input arguments.
    pub input: serde_json::Value,
}

/// A recorded tool result awaiting commit.
#[derive(Debug, Clone)]
pub struct PendingToolResult {
    /// The tool-call id this result answers.
    pub tool_call_id: ToolCallId,
    /// The tool name.
    pub name: String,
    /// The tool's output.
    pub output: Vec<OutputPart>,
}

/// The append-only, commit-at-end conversation log for one agent.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    /// Create a log seeded with an initial history (e.g. a system message
    /// plus any inherited parent history).
    #[must_use]
    pub const fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Capture the pre-step prefix. The returned [`History`] is what
    /// `commit` will prepend to the step's new messages.
    #[must_use]
    pub fn snapshot(&self) -> History {
        self.messages.clone()
    }

    /// Borrow the current messages (read-only, for prompt assembly between
    /// steps).
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append assistant text directly, outside the per-step commit flow.
    /// Used for templates whose `handleSteps` program emits text without
    /// going through the dispatcher.
    pub fn append_assistant_text(&mut self, text: impl Into<String>) {
        self.messages
            .push(Message::assistant(vec![AssistantPart::text(text)]));
    }

    /// Append a tool-call part as a new assistant message, outside the
    /// per-step commit flow.
    pub fn append_assistant_tool_call(
        &mut self,
        id: impl Into<ToolCallId>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) {
        self.messages.push(Message::assistant(vec![
            AssistantPart::tool_call(id, name, input),
        ]));
    }

    /// Append a tool result directly, outside the per-step commit flow.
    pub fn append_tool_result(
        &mut self,
        id: impl Into<ToolCallId>,
        name: impl Into<String>,
        output: Vec<OutputPart>,
    ) {
        self.messages.push(Message::tool(id, name, output));
    }

    /// Append a synthetic user-visible error message, never paired with a
    /// tool message (used when a tool call fails validation before
    /// dispatch).
    pub fn append_user_error(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user(text));
    }

    /// Replace the log with `snapshot ++ assistantParts ++
    /// tool-call-parts-as-assistant ++ toolResults ++ userErrors`.
    ///
    /// `assistant_parts` are the plain text parts emitted before the first
    /// tool call (and any text interleaved by inline tool-call extraction);
    /// `tool_calls` are the tool-call parts in parse order; `tool_results`
    /// are the corresponding results (not necessarily resolved in parse
    /// order, but `commit` always re-sorts them to it via the caller
    /// supplying them already ordered — see
    /// [`crate::dispatch::ToolDispatcher`]).
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvariantBreach`] if `tool_results` contains an
    /// id with no matching entry in `tool_calls` (an orphaned result), or if
    /// a result's id does not match `tool_calls` in order (a pairing or
    /// adjacency violation).
    pub fn commit(
        &mut self,
        snapshot: History,
        assistant_parts: Vec<AssistantPart>,
        tool_calls: Vec<PendingToolCall>,
        tool_results: Vec<PendingToolResult>,
        user_errors: Vec<String>,
    ) -> Result<()> {
        for result in &tool_results {
            if !tool_calls.iter().any(|tc| tc.id == result.tool_call_id) {
                return Err(AgentError::InvariantBreach(format!(
                    "tool result {} has no matching tool-call part",
                    result.tool_call_id
                )));
            }
        }
        if tool_results.len() != tool_calls.len() {
            return Err(AgentError::InvariantBreach(format!(
                "{} tool call(s) but {} tool result(s)",
                tool_calls.len(),
                tool_results.len()
            )));
        }
        for (call, result) in tool_calls.iter().zip(tool_results.iter()) {
            if call.id != result.tool_call_id {
                return Err(AgentError::InvariantBreach(format!(
                    "tool result order mismatch: expected {}, got {}",
                    call.id, result.tool_call_id
                )));
            }
        }

        let mut rebuilt = snapshot;

        if !assistant_parts.is_empty() || !tool_calls.is_empty() {
            let mut parts = assistant_parts;
            parts.extend(
                tool_calls
                    .iter()
                    .map(|tc| AssistantPart::tool_call(tc.id.clone(), tc.name.clone(), tc.input.clone())),
            );
            rebuilt.push(Message::assistant(parts));
        }

        for result in tool_results {
            rebuilt.push(Message::tool(result.tool_call_id, result.name, result.output));
        }

        for err in user_errors {
            rebuilt.push(Message::user(err));
        }

        self.messages = rebuilt;
        Ok(())
    }

    /// Check pairing over the whole log: every `tool` message's id
    /// matches exactly one preceding assistant tool-call part, no tool call
    /// id is paired more than once, and no result is orphaned.
    #[must_use]
    pub fn check_pairing(&self) -> bool {
        let mut seen_calls: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut answered: std::collections::HashSet<&str> = std::collections::HashSet::new();

        for msg in &self.messages {
            match msg {
                Message::Assistant { parts } => {
                    for part in parts {
                        if let AssistantPart::ToolCall { id, .. } = part {
                            if !seen_calls.insert(id.as_str()) {
                                return false;
                            }
                        }
                    }
                }
                Message::Tool { tool_call_id, .. } => {
                    if !seen_calls.contains(tool_call_id.as_str()) {
                        return false;
                    }
                    if !answered.insert(tool_call_id.as_str()) {
                        return false;
                    }
                }
                Message::System { .. } | Message::User { .. } => {}
            }
        }
        true
    }
}
