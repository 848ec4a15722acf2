//! The tool dispatcher (component C4).
//!
//! Runs every tool call parsed from one assistant message, enforces the
//! a fixed set of ordering guarantees, and hands back results already reordered to
//! match the calls (so [`crate::log::MessageLog::commit`] never has to
//! reorder anything itself).
//!
//! Calls that share a [`crate::tool::ToolDescriptor::serialization_key`]
//! (e.g. two writes to the same file path) are chained through a spine of
//! one-shot channels so the second call's externally-visible effects start
//! only after the first's have been recorded - this is the Rust realization
//! of a `previousToolCallFinished`-style chained-handle pattern. Calls with
//! no shared key, or no key at all, run fully concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::error::AgentError;
use crate::log::{PendingToolCall, PendingToolResult};
use crate::message::OutputPart;
use crate::ports::{ClientToolCall, SpawnChildPort, SpawnRequest, ToolClientPort};
use crate::state::AgentIdentifier;
use crate::tool::{ToolDescriptor, ToolHandler, ToolRegistry};

/// One tool call as parsed off the stream, ready for dispatch.
#[derive(Debug, Clone)]
pub struct DispatchCall {
    /// The tool-call id.
    pub id: String,
    /// The tool name.
    pub name: String,
    /// The tool's (not-yet-validated) input.
    pub input: serde_json::Value,
}

/// Whether the step ends as a result of dispatching these calls, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEndSignal {
    /// No call this step ended the step.
    None,
    /// Exactly one call ended the step (the first `ends_agent_step` tool
    /// encountered in parse order; see `DESIGN.md` for the rationale).
    Ended {
        /// The id of the call that ended the step.
        tool_call_id: String,
    },
}

/// The dispatcher's output for one step: the calls actually dispatched (post
/// spawn-shim rewrite, with unknown/invalid calls dropped), their results in
/// the same order, any synthesized user-visible errors, and whether the
/// step ended.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// The calls actually dispatched, in order - what `commit` should
    /// record as tool-call assistant parts. Excludes calls rejected as
    /// unknown or schema-invalid, and reflects the spawn-shim rewrite.
    pub tool_calls: Vec<PendingToolCall>,
    /// Tool results, in the same order as `tool_calls`.
    pub results: Vec<PendingToolResult>,
    /// User-visible error messages for calls rejected before dispatch
    /// (unknown tool name or schema-invalid input). Committed as trailing
    /// `user` messages, never paired with a `tool` message.
    pub user_errors: Vec<String>,
    /// Whether any call this step was rejected as unknown or invalid.
    pub had_tool_call_error: bool,
    /// Whether dispatching these calls ended the step.
    pub end_signal: StepEndSignal,
}

/// Dispatches tool calls against a [`ToolRegistry`].
pub struct ToolDispatcher<'a> {
    registry: &'a ToolRegistry,
    tool_client: Option<Arc<dyn ToolClientPort>>,
    spawn_child: Option<&'a dyn SpawnChildPort>,
    spawnable_agents: &'a [AgentIdentifier],
}

impl<'a> ToolDispatcher<'a> {
    /// Build a dispatcher over `registry`, with the ports needed for
    /// client-delegated and spawning handlers.
    ///
    /// `spawn_child` is borrowed rather than `Arc`-owned because the
    /// production implementation (`RecursiveSpawner` in `orchestrator.rs`)
    /// borrows the orchestrator itself for the duration of one `run` call,
    /// and every dispatcher built during that run shares that borrow.
    ///
    /// `spawnable_agents` is the current template's spawn allowlist, used
    /// to rewrite a call naming one of those agents directly into a
    /// `spawn_agents` call (the `spawnableAgents` compatibility shim).
    #[must_use]
    pub const fn new(
        registry: &'a ToolRegistry,
        tool_client: Option<Arc<dyn ToolClientPort>>,
        spawn_child: Option<&'a dyn SpawnChildPort>,
        spawnable_agents: &'a [AgentIdentifier],
    ) -> Self {
        Self {
            registry,
            tool_client,
            spawn_child,
            spawnable_agents,
        }
    }

    /// Rewrite `call` into a `spawn_agents` call if its name doesn't match a
    /// registered tool but does match one of `spawnable_agents`, by either
    /// the agent's bare id or its full `publisher/id@version` form.
    fn apply_spawn_shim(&self, call: DispatchCall) -> DispatchCall {
        if self.registry.contains(&call.name) {
            return call;
        }
        let Some(matched) = self
            .spawnable_agents
            .iter()
            .find(|agent| agent.id == call.name || agent.to_string() == call.name)
        else {
            return call;
        };

        let prompt = call
            .input
            .get("prompt")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let rewritten_input = serde_json::json!({
            "agents": [{
                "agentType": matched.to_string(),
                "prompt": prompt,
                "params": call.input,
            }],
        });

        DispatchCall {
            id: call.id,
            name: "spawn_agents".to_owned(),
            input: rewritten_input,
        }
    }

    /// Dispatch `calls` in parse order.
    ///
    /// Unknown tools and schema-invalid input never reach a handler: they
    /// are dropped from the dispatched set entirely and surfaced only as an
    /// entry in [`DispatchOutcome::user_errors`], so a rejected call can
    /// never leave an orphaned tool-call part or paired result behind.
    #[instrument(skip(self, calls), fields(call_count = calls.len()))]
    pub async fn dispatch(&self, calls: Vec<DispatchCall>) -> DispatchOutcome {
        let mut had_tool_call_error = false;
        let mut user_errors = Vec::new();
        let mut accepted: Vec<(DispatchCall, &ToolDescriptor)> = Vec::with_capacity(calls.len());

        for call in calls {
            let call = self.apply_spawn_shim(call);

            let Some(descriptor) = self.registry.get(&call.name) else {
                warn!(tool = %call.name, "unknown tool");
                had_tool_call_error = true;
                user_errors.push(AgentError::ToolUnknown { name: call.name.clone() }.inline_message());
                continue;
            };

            if let Err(err) = descriptor.validate_input(&call.input) {
                warn!(tool = %call.name, error = %err, "tool input failed validation");
                had_tool_call_error = true;
                user_errors.push(err.inline_message());
                continue;
            }

            accepted.push((call, descriptor));
        }

        // Build the serialization spine: group call indices by
        // serialization key, chaining same-key calls with oneshot handoffs.
        let mut chains: HashMap<String, Vec<usize>> = HashMap::new();
        let mut waiters: Vec<Option<oneshot::Receiver<()>>> =
            (0..accepted.len()).map(|_| None).collect();
        let mut signals: Vec<Option<oneshot::Sender<()>>> =
            (0..accepted.len()).map(|_| None).collect();

        for (index, (call, descriptor)) in accepted.iter().enumerate() {
            let Some(key_fn) = descriptor.serialization_key else {
                continue;
            };
            let Some(key) = key_fn(&call.input) else {
                continue;
            };
            chains.entry(key).or_default().push(index);
        }
        for indices in chains.values() {
            for window in indices.windows(2) {
                let (prev, next) = (window[0], window[1]);
                let (tx, rx) = oneshot::channel();
                signals[prev] = Some(tx);
                waiters[next] = Some(rx);
            }
        }

        let mut end_signal = StepEndSignal::None;
        let mut tool_calls = Vec::with_capacity(accepted.len());
        let mut futures = Vec::with_capacity(accepted.len());

        for (index, (call, descriptor)) in accepted.into_iter().enumerate() {
            let waiter = waiters[index].take();
            let signal = signals[index].take();
            if end_signal == StepEndSignal::None && descriptor.ends_agent_step {
                end_signal = StepEndSignal::Ended {
                    tool_call_id: call.id.clone(),
                };
            }
            tool_calls.push(PendingToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
            futures.push(self.dispatch_one(call, waiter, signal));
        }

        let resolved = futures::future::join_all(futures).await;

        DispatchOutcome {
            tool_calls,
            results: resolved,
            user_errors,
            had_tool_call_error,
            end_signal,
        }
    }

    async fn dispatch_one(
        &self,
        call: DispatchCall,
        waiter: Option<oneshot::Receiver<()>>,
        signal: Option<oneshot::Sender<()>>,
    ) -> PendingToolResult {
        let DispatchCall { id, name, input } = call;

        // Existence and schema validity were already checked in `dispatch`
        // before this call was accepted into the dispatched set.
        let descriptor = self
            .registry
            .get(&name)
            .expect("dispatch_one only runs for registry-resolved calls");

        if let Some(waiter) = waiter {
            let _ = waiter.await;
        }

        debug!(tool = %name, call_id = %id, "dispatching tool call");

        let output = match &descriptor.handler {
            ToolHandler::InProcess(tool) => match tool.call(input).await {
                Ok(output) => output,
                Err(err) => vec![OutputPart::error_text(err.inline_message())],
            },
            ToolHandler::ClientDelegated => match &self.tool_client {
                Some(client) => {
                    let call = ClientToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        input,
                    };
                    match client.dispatch(call).await {
                        Ok(output) => output,
                        Err(err) => vec![OutputPart::error_text(err.inline_message())],
                    }
                }
                None => vec![OutputPart::error_text(
                    AgentError::Internal("no tool client port configured".into()).inline_message(),
                )],
            },
            ToolHandler::Spawning => self.dispatch_spawn(&name, input).await,
        };

        if let Some(signal) = signal {
            let _ = signal.send(());
        }

        PendingToolResult {
            tool_call_id: id,
            name,
            output,
        }
    }

    async fn dispatch_spawn(&self, name: &str, input: serde_json::Value) -> Vec<OutputPart> {
        let Some(spawn_child) = &self.spawn_child else {
            return vec![OutputPart::error_text(
                AgentError::Internal("no spawn-child port configured".into()).inline_message(),
            )];
        };

        let sync = input
            .get("sync")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);

        let Some(agents) = input.get("agents").and_then(serde_json::Value::as_array) else {
            return vec![OutputPart::error_text(
                (AgentError::ToolInputInvalid {
                    tool_name: name.to_owned(),
                    message: "missing 'agents' list".to_owned(),
                })
                .inline_message(),
            )];
        };

        let mut requests = Vec::with_capacity(agents.len());
        for entry in agents {
            let agent = entry
                .get("agentType")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| AgentError::ToolInputInvalid {
                    tool_name: name.to_owned(),
                    message: "missing 'agentType' field".to_owned(),
                })
                .and_then(|s| s.parse::<AgentIdentifier>());
            let agent = match agent {
                Ok(agent) => agent,
                Err(err) => return vec![OutputPart::error_text(err.inline_message())],
            };
            let prompt = entry
                .get("prompt")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let params = entry.get("params").cloned();
            requests.push(SpawnRequest { agent, prompt, params, sync });
        }

        if sync {
            let outcomes = futures::future::join_all(
                requests.into_iter().map(|req| spawn_child.spawn(req)),
            )
            .await;

            let mut results = Vec::with_capacity(outcomes.len());
            for outcome in outcomes {
                match outcome {
                    Ok(outcome) => results.push(serde_json::json!({
                        "run_id": outcome.run_id,
                        "output": outcome.output,
                        "credits_used": outcome.credits_used,
                        "terminal": outcome.terminal,
                    })),
                    Err(err) => return vec![OutputPart::error_text(err.inline_message())],
                }
            }
            vec![OutputPart::json(serde_json::json!({ "results": results }))]
        } else {
            for req in requests {
                if let Err(err) = spawn_child.spawn(req).await {
                    return vec![OutputPart::error_text(err.inline_message())];
                }
            }
            vec![OutputPart::text("spawned")]
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::Result;
    use crate::tool::{Tool, ToolDescriptor, ToolOutput};

    struct Recorder {
        log: Arc<tokio::sync::Mutex<Vec<String>>>,
        label: &'static str,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for Recorder {
        async fn call(&self, _input: serde_json::Value) -> Result<ToolOutput> {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            self.log.lock().await.push(self.label.to_owned());
            Ok(vec![OutputPart::text(self.label)])
        }
    }

    fn path_key(input: &serde_json::Value) -> Option<String> {
        input.get("path").and_then(serde_json::Value::as_str).map(String::from)
    }

    fn recorder_descriptor(name: &str, label: &'static str, delay_ms: u64, key: bool) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_owned(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
            ends_agent_step: false,
            serialization_key: if key { Some(path_key) } else { None },
            handler: ToolHandler::InProcess(Arc::new(Recorder {
                log: Arc::new(tokio::sync::Mutex::new(Vec::new())),
                label,
                delay_ms,
            })),
        }
    }

    #[tokio::test]
    async fn unknown_tool_produces_user_error_not_tool_message() {
        let registry = ToolRegistry::new();
        let dispatcher = ToolDispatcher::new(&registry, None, None, &[]);
        let outcome = dispatcher
            .dispatch(vec![DispatchCall {
                id: "tc_1".into(),
                name: "bogus".into(),
                input: json!({}),
            }])
            .await;
        assert!(outcome.tool_calls.is_empty());
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.user_errors.len(), 1);
        assert!(outcome.had_tool_call_error);
    }

    #[tokio::test]
    async fn results_come_back_in_call_order() {
        let mut registry = ToolRegistry::new();
        registry.register(recorder_descriptor("slow", "slow", 20, false));
        registry.register(recorder_descriptor("fast", "fast", 0, false));
        let dispatcher = ToolDispatcher::new(&registry, None, None, &[]);

        let outcome = dispatcher
            .dispatch(vec![
                DispatchCall { id: "tc_1".into(), name: "slow".into(), input: json!({}) },
                DispatchCall { id: "tc_2".into(), name: "fast".into(), input: json!({}) },
            ])
            .await;

        assert_eq!(outcome.results[0].tool_call_id, "tc_1");
        assert_eq!(outcome.results[1].tool_call_id, "tc_2");
        assert!(!outcome.had_tool_call_error);
    }

    #[tokio::test]
    async fn ends_agent_step_flags_first_matching_call() {
        let mut registry = ToolRegistry::new();
        let mut ending = recorder_descriptor("end_turn", "end", 0, false);
        ending.ends_agent_step = true;
        registry.register(ending);
        registry.register(recorder_descriptor("noop", "noop", 0, false));
        let dispatcher = ToolDispatcher::new(&registry, None, None, &[]);

        let outcome = dispatcher
            .dispatch(vec![
                DispatchCall { id: "tc_1".into(), name: "noop".into(), input: json!({}) },
                DispatchCall { id: "tc_2".into(), name: "end_turn".into(), input: json!({}) },
            ])
            .await;

        assert_eq!(
            outcome.end_signal,
            StepEndSignal::Ended { tool_call_id: "tc_2".into() }
        );
    }
}
