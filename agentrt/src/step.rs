//! The agent step runner (component C5).
//!
//! Drives one step through `PREPARING -> STREAMING -> DRAINING ->
//! COMMITTED`, with `ABORTED` and `FAILED` terminal branches reachable from
//! any of the three in-flight states. `COMMITTED` is the only state that
//! mutates [`crate::log::MessageLog`] - everything before it is building up
//! the arguments to a single [`crate::log::MessageLog::commit`] call.

use futures::StreamExt;
use tracing::{debug, instrument, warn};

use crate::dispatch::{DispatchCall, StepEndSignal, ToolDispatcher};
use crate::error::{AgentError, Result};
use crate::log::{MessageLog, PendingToolCall};
use crate::message::AssistantPart;
use crate::ports::{LlmPort, LlmRequest};
use crate::stream::{FeedResult, ParsedEvent, StreamOutcome, StreamParser};
use crate::tool::ToolRegistry;
use crate::usage::Usage;

/// The step state machine's current phase, exposed for telemetry and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// Assembling the prompt and request.
    Preparing,
    /// Consuming the LLM's event stream.
    Streaming,
    /// Dispatching parsed tool calls and awaiting their results.
    Draining,
    /// The step's log entries have been committed.
    Committed,
    /// The step was cancelled before it committed.
    Aborted,
    /// The step failed and produced no log entries.
    Failed,
}

/// What a completed step produced.
#[derive(Debug)]
pub struct StepOutcome {
    /// The final phase the step reached.
    pub phase: StepPhase,
    /// Whether a tool call ended the step.
    pub ended_step: bool,
    /// Token usage reported for the step, if any.
    pub usage: Option<Usage>,
    /// Number of tool calls dispatched.
    pub tool_call_count: usize,
    /// Whether any call this step was rejected as unknown or invalid.
    pub had_tool_call_error: bool,
}

/// Runs a single step: prepare the request, stream the response, dispatch
/// any tool calls, and commit the result to the log.
pub struct AgentStepRunner<'a> {
    llm: &'a dyn LlmPort,
    registry: &'a ToolRegistry,
    dispatcher: &'a ToolDispatcher<'a>,
    id_gen: &'a (dyn Fn() -> String + Sync),
}

impl<'a> AgentStepRunner<'a> {
    /// Build a runner for one step.
    #[must_use]
    pub const fn new(
        llm: &'a dyn LlmPort,
        registry: &'a ToolRegistry,
        dispatcher: &'a ToolDispatcher<'a>,
        id_gen: &'a (dyn Fn() -> String + Sync),
    ) -> Self {
        Self { llm, registry, dispatcher, id_gen }
    }

    /// Run one step against `log`, given the rendered `system` prompt.
    ///
    /// `abort` is polled between phases; if it is already set when `run` is
    /// called, or becomes set while streaming, the step transitions to
    /// `ABORTED` and appends an interruption-marked partial assistant
    /// message rather than committing a normal step.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::LlmTransport`] if the LLM port fails, or
    /// [`AgentError::InvariantBreach`] if `commit` would violate pairing.
    #[instrument(skip(self, log, abort), fields(step_index))]
    pub async fn run(
        &self,
        log: &mut MessageLog,
        system: String,
        abort: &std::sync::atomic::AtomicBool,
    ) -> Result<StepOutcome> {
        use std::sync::atomic::Ordering;

        // PREPARING
        let snapshot = log.snapshot();
        let request = LlmRequest {
            system,
            history: snapshot.clone(),
            tool_definitions: self.registry.definitions(),
        };

        if abort.load(Ordering::SeqCst) {
            return Ok(self.abort_step(log, snapshot, Vec::new()));
        }

        // STREAMING
        let mut events = self
            .llm
            .stream(request)
            .await
            .map_err(|e| AgentError::LlmTransport(e.to_string()))?;

        let mut parser = StreamParser::new(self.id_gen);
        let mut text_parts: Vec<AssistantPart> = Vec::new();
        let mut tool_calls: Vec<PendingToolCall> = Vec::new();
        let mut usage = None;

        loop {
            if abort.load(Ordering::SeqCst) {
                parser.abort();
                return Ok(self.abort_step(log, snapshot, text_parts));
            }

            let Some(event) = events.next().await else {
                break;
            };

            match parser.feed(event) {
                FeedResult::Events(parsed) => {
                    self.fold_events(parsed, &mut text_parts, &mut tool_calls);
                }
                FeedResult::Terminal(parsed, outcome) => {
                    self.fold_events(parsed, &mut text_parts, &mut tool_calls);
                    if let StreamOutcome::Completed { usage: reported, .. } = outcome {
                        usage = reported;
                    }
                    break;
                }
            }
        }

        debug!(tool_calls = tool_calls.len(), "step streamed");

        // DRAINING
        let dispatch_calls: Vec<DispatchCall> = tool_calls
            .iter()
            .map(|tc| DispatchCall {
                id: tc.id.clone(),
                name: tc.name.clone(),
                input: tc.input.clone(),
            })
            .collect();

        let outcome = self.dispatcher.dispatch(dispatch_calls).await;
        let ended_step = !matches!(outcome.end_signal, StepEndSignal::None);
        let tool_call_count = outcome.tool_calls.len();
        let had_tool_call_error = outcome.had_tool_call_error;

        // COMMITTED
        log.commit(
            snapshot,
            text_parts,
            outcome.tool_calls,
            outcome.results,
            outcome.user_errors,
        )?;

        Ok(StepOutcome {
            phase: StepPhase::Committed,
            ended_step,
            usage,
            tool_call_count,
            had_tool_call_error,
        })
    }

    fn fold_events(
        &self,
        events: Vec<ParsedEvent>,
        text_parts: &mut Vec<AssistantPart>,
        tool_calls: &mut Vec<PendingToolCall>,
    ) {
        for event in events {
            match event {
                ParsedEvent::Text(text) => text_parts.push(AssistantPart::text(text)),
                ParsedEvent::Reasoning(_) => {
                    // Reasoning content never enters the committed log.
                }
                ParsedEvent::ToolCall { id, name, input, .. } => {
                    tool_calls.push(PendingToolCall { id, name, input });
                }
            }
        }
    }

    fn abort_step(
        &self,
        log: &mut MessageLog,
        snapshot: crate::log::History,
        text_parts: Vec<AssistantPart>,
    ) -> StepOutcome {
        warn!("step aborted");
        let mut rebuilt = snapshot;
        if !text_parts.is_empty() {
            let mut message = crate::message::Message::assistant(text_parts);
            message.append_interruption_marker();
            rebuilt.push(message);
        }
        *log = MessageLog::new(rebuilt);
        StepOutcome {
            phase: StepPhase::Aborted,
            ended_step: false,
            usage: None,
            tool_call_count: 0,
            had_tool_call_error: false,
        }
    }
}
