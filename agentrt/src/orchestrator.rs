//! The agent orchestrator (component C6).
//!
//! Drives [`AgentStepRunner`] in a loop until one of the terminal
//! conditions is reached: `completed` (a tool ended the step), `max_steps`,
//! `aborted`, `error`, or `out_of_credits`. Also owns
//! the synchronous-child spawn path (`run_child`), bounding sibling
//! concurrency with a semaphore, and aggregates child credit spend into the
//! parent's running total as each synchronous child finishes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::credit::{step_operation_id, CreditGate};
use crate::dispatch::ToolDispatcher;
use crate::error::{AgentError, Result};
use crate::log::MessageLog;
use crate::ports::{
    Clock, EnvPort, IdGen, LlmPort, RunFinished, RunStarted, SpawnChildPort, SpawnOutcome,
    SpawnRequest, StepRecorded, TelemetrySink, TemplateSource, ToolClientPort,
};
use crate::state::{AgentIdentifier, AgentState, RunContext};
use crate::step::{AgentStepRunner, StepPhase};
use crate::template::TemplateAssembler;
use crate::tool::ToolRegistry;

/// The terminal state a run ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// A tool call ended the step (`task_completed`, `end_turn`, or an
    /// async spawn).
    Completed,
    /// The run exhausted its step budget without ending itself.
    MaxSteps,
    /// The run was aborted.
    Aborted,
    /// The run failed with an unrecoverable error.
    Error,
    /// The credit gate refused to start another step.
    OutOfCredits,
}

impl Terminal {
    /// The short tag used in telemetry records and spawn outcomes.
    #[must_use]
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::MaxSteps => "max_steps",
            Self::Aborted => "aborted",
            Self::Error => "error",
            Self::OutOfCredits => "out_of_credits",
        }
    }
}

/// What a run produced.
#[derive(Debug)]
pub struct AgentOutput {
    /// The run's id.
    pub run_id: String,
    /// How the run ended.
    pub terminal: Terminal,
    /// The final assistant text, if any step produced one.
    pub final_text: Option<String>,
    /// This run's own charges, excluding anything aggregated up from
    /// synchronous children.
    pub direct_credits_used: i64,
    /// Total credits consumed by this run and any synchronous children.
    pub credits_used: i64,
    /// Run ids of every child this run spawned, sync or async, in spawn
    /// order.
    pub spawned_child_run_ids: Vec<String>,
    /// The number of steps executed.
    pub steps_executed: u32,
    /// The error that caused `Terminal::Error`, if applicable.
    pub error: Option<AgentError>,
}

/// Tunables for [`AgentOrchestrator`] beyond what a template itself fixes.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on concurrently running synchronous children (default is
    /// sequential, i.e. `1`).
    pub max_concurrent_children: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_concurrent_children: 1 }
    }
}

/// The injected collaborators an orchestrator needs, grouped so
/// construction doesn't take an unreadable wall of positional arguments.
pub struct OrchestratorPorts {
    /// The LLM port used to stream each step.
    pub llm: Arc<dyn LlmPort>,
    /// Optional client-delegated tool port.
    pub tool_client: Option<Arc<dyn ToolClientPort>>,
    /// The template source backing the template assembler.
    pub template_source: Arc<dyn TemplateSource>,
    /// The credit backend backing the credit gate.
    pub credit_gate: Arc<CreditGate>,
    /// Telemetry sink for run/step records.
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Clock used for timestamping telemetry.
    pub clock: Arc<dyn Clock>,
    /// Id generator used for run ids, tool-call ids, and operation ids.
    pub id_gen: Arc<dyn IdGen>,
    /// Deployment configuration and secrets (api keys, env tag, base URLs).
    pub env: Arc<dyn EnvPort>,
}

/// Drives one agent's run to completion.
pub struct AgentOrchestrator {
    ports: OrchestratorPorts,
    registry: ToolRegistry,
    templates: TemplateAssembler,
    config: OrchestratorConfig,
    child_semaphore: Arc<Semaphore>,
}

impl AgentOrchestrator {
    /// Build an orchestrator. `registry` should already contain every
    /// in-process, client-delegated, and spawning tool the deployment
    /// supports; templates select a subset per agent via
    /// [`TemplateAssembler::select_tools`].
    #[must_use]
    pub fn new(ports: OrchestratorPorts, registry: ToolRegistry, config: OrchestratorConfig) -> Self {
        let templates = TemplateAssembler::new(ports.template_source.clone());
        let child_semaphore = Arc::new(Semaphore::new(config.max_concurrent_children.max(1)));
        Self { ports, registry, templates, config, child_semaphore }
    }

    /// Run `identifier` against `task`, under `context`.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that prevent even starting the
    /// run (template resolution, preflight credit check); failures during
    /// the run itself are reported as `Terminal::Error` in the returned
    /// [`AgentOutput`] rather than propagated.
    #[instrument(skip(self, abort), fields(run_id = %context.run_id))]
    pub async fn run(
        &self,
        identifier: AgentIdentifier,
        task: &str,
        context: RunContext,
        abort: Arc<AtomicBool>,
    ) -> Result<AgentOutput> {
        let template = self.templates.resolve(&identifier).await?;
        self.ports.credit_gate.preflight(&context.credit_account).await?;

        self.ports.telemetry.start_run(RunStarted {
            run_id: context.run_id.clone(),
            agent: identifier.clone(),
            parent_run_id: context.parent_run_id.clone(),
            env_tag: self.ports.env.env_tag(),
            started_at: self.ports.clock.now(),
        });

        let system = template.render_system_prompt(&serde_json::json!({ "task": task }))?;
        let seed = template.seed_messages(system.clone(), task);
        let mut state = AgentState::new(identifier, MessageLog::new(seed), context);

        let id_gen = self.ports.id_gen.clone();
        let id_gen_fn = move || id_gen.new_id("tc");

        let child_credits = Arc::new(AtomicI64::new(0));
        let spawned_child_run_ids = Arc::new(Mutex::new(Vec::new()));

        let spawn_port = RecursiveSpawner {
            orchestrator: self,
            parent_context: state.context.clone(),
            abort: abort.clone(),
            child_credits: child_credits.clone(),
            spawned_child_run_ids: spawned_child_run_ids.clone(),
        };

        let mut retried_step_indices: HashSet<u32> = HashSet::new();
        let mut final_text = None;
        let terminal;
        let mut error = None;

        loop {
            if abort.load(Ordering::SeqCst) {
                terminal = Terminal::Aborted;
                break;
            }
            if state.step_index >= state.context.max_steps {
                terminal = Terminal::MaxSteps;
                break;
            }
            if self
                .ports
                .credit_gate
                .preflight(&state.context.credit_account)
                .await
                .is_err()
            {
                terminal = Terminal::OutOfCredits;
                break;
            }

            let dispatcher = ToolDispatcher::new(
                &self.registry,
                self.ports.tool_client.clone(),
                Some(&spawn_port),
                &template.spawnable_agents,
            );
            let runner = AgentStepRunner::new(
                self.ports.llm.as_ref(),
                &self.registry,
                &dispatcher,
                &id_gen_fn,
            );

            let step_index = state.step_index;
            let outcome = runner.run(&mut state.log, system.clone(), abort.as_ref()).await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(AgentError::LlmTransport(message))
                    if !retried_step_indices.contains(&step_index)
                        && state.step_index + 1 < state.context.max_steps =>
                {
                    warn!(step_index, message, "retrying step once after transport error");
                    retried_step_indices.insert(step_index);
                    continue;
                }
                Err(err) => {
                    error = Some(err);
                    terminal = Terminal::Error;
                    break;
                }
            };

            if outcome.phase == StepPhase::Aborted {
                terminal = Terminal::Aborted;
                break;
            }

            let step_credits = 1i64;
            let operation_id = step_operation_id(&state.context.run_id, step_index);
            if let Err(err) = self
                .ports
                .credit_gate
                .settle(&state.context.credit_account, step_credits, &operation_id)
                .await
            {
                error = Some(err);
                terminal = Terminal::Error;
                break;
            }
            state.direct_credits_used += step_credits;
            state.credits_used = state.direct_credits_used + child_credits.load(Ordering::SeqCst);
            state.spawned_child_run_ids = spawned_child_run_ids.lock().unwrap().clone();

            self.ports.telemetry.add_step(StepRecorded {
                run_id: state.context.run_id.clone(),
                step_index,
                tool_call_count: outcome.tool_call_count,
                had_tool_call_error: outcome.had_tool_call_error,
                usage: outcome.usage,
                credits_charged: step_credits,
            });

            final_text = state.log.messages().iter().rev().find_map(crate::message::Message::assistant_text);
            state.step_index += 1;

            if outcome.ended_step {
                terminal = Terminal::Completed;
                break;
            }
        }

        state.credits_used = state.direct_credits_used + child_credits.load(Ordering::SeqCst);
        state.spawned_child_run_ids = spawned_child_run_ids.lock().unwrap().clone();

        self.ports.telemetry.finish_run(RunFinished {
            run_id: state.context.run_id.clone(),
            terminal: terminal.as_tag().to_owned(),
            credits_used: state.credits_used,
            finished_at: self.ports.clock.now(),
        });

        info!(terminal = terminal.as_tag(), steps = state.step_index, "run finished");

        Ok(AgentOutput {
            run_id: state.context.run_id,
            terminal,
            final_text,
            direct_credits_used: state.direct_credits_used,
            credits_used: state.credits_used,
            spawned_child_run_ids: state.spawned_child_run_ids,
            steps_executed: state.step_index,
            error,
        })
    }

    /// Run one synchronous child to completion, bounded by
    /// `max_concurrent_children`, and aggregate its credits into the
    /// parent's total on return.
    async fn run_child(&self, request: SpawnRequest, parent_context: RunContext) -> Result<SpawnOutcome> {
        let permit = self
            .child_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?;

        let child_run_id = self.ports.id_gen.new_id("run");
        let child_context = parent_context.child(child_run_id.clone());
        let abort = Arc::new(AtomicBool::new(false));

        let prompt = request.effective_prompt();
        let output = self.run(request.agent, &prompt, child_context, abort).await;
        drop(permit);

        let output = output?;
        Ok(SpawnOutcome {
            run_id: child_run_id,
            output: output.final_text,
            credits_used: output.credits_used,
            terminal: output.terminal.as_tag().to_owned(),
        })
    }
}

/// A [`SpawnChildPort`] that recurses back into the owning orchestrator,
/// the production default for synchronous and async spawns alike.
struct RecursiveSpawner<'a> {
    orchestrator: &'a AgentOrchestrator,
    parent_context: RunContext,
    abort: Arc<AtomicBool>,
    /// Shared with the owning run: sync children add their total spend here
    /// so the parent's `credits_used` stays `direct + sum of children`.
    child_credits: Arc<AtomicI64>,
    /// Shared with the owning run: every spawned child's run id lands here,
    /// sync or async, in spawn order.
    spawned_child_run_ids: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SpawnChildPort for RecursiveSpawner<'_> {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnOutcome> {
        if !self.parent_context.can_spawn() {
            return Err(AgentError::Internal(
                "max spawn depth exceeded".to_owned(),
            ));
        }

        if request.sync {
            let outcome = self
                .orchestrator
                .run_child(request, self.parent_context.clone())
                .await?;
            self.child_credits.fetch_add(outcome.credits_used, Ordering::SeqCst);
            self.spawned_child_run_ids.lock().unwrap().push(outcome.run_id.clone());
            Ok(outcome)
        } else {
            // Async spawn: the parent does not await the child's
            // completion as part of its own step, but this in-process port
            // still runs the child to completion before returning, rather
            // than detaching it onto a separate task - see `DESIGN.md` for
            // why credit aggregation treats async children as not-yet-
            // charged against the parent regardless.
            let child_run_id = self.orchestrator.ports.id_gen.new_id("run");
            let child_context = self.parent_context.child(child_run_id.clone());
            let abort = self.abort.clone();
            let agent = request.agent.clone();
            let prompt = request.effective_prompt();

            self.spawned_child_run_ids.lock().unwrap().push(child_run_id.clone());

            let outcome = self
                .orchestrator
                .run(agent, &prompt, child_context, abort)
                .await?;
            Ok(SpawnOutcome {
                run_id: child_run_id,
                output: outcome.final_text,
                credits_used: outcome.credits_used,
                terminal: outcome.terminal.as_tag().to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::HashSet as StdHashSet;

    use super::*;
    use crate::credit::CreditGate;
    use crate::ports::{
        Balance, CreditBackend, CreditBackendError, LlmRequest, NullTelemetrySink, SystemClock,
        SystemEnv, UuidGen,
    };
    use crate::stream::LlmEvent;
    use crate::template::AgentTemplate;

    struct OneShotLlm;

    #[async_trait]
    impl LlmPort for OneShotLlm {
        async fn stream(
            &self,
            _request: LlmRequest,
        ) -> Result<futures::stream::BoxStream<'static, LlmEvent>> {
            Ok(Box::pin(stream::iter(vec![
                LlmEvent::TextDelta("<task_completed></task_completed>".into()),
                LlmEvent::End { message_id: None, usage: None },
            ])))
        }
    }

    struct InfiniteBalance;

    #[async_trait]
    impl CreditBackend for InfiniteBalance {
        async fn balance(&self, _user: &str) -> std::result::Result<Balance, CreditBackendError> {
            Ok(Balance { amount: 1000 })
        }
        async fn settle(
            &self,
            _user: &str,
            _amount: i64,
            _operation_id: &str,
        ) -> std::result::Result<(), CreditBackendError> {
            Ok(())
        }
    }

    struct FixedTemplate;

    #[async_trait]
    impl TemplateSource for FixedTemplate {
        async fn fetch(&self, identifier: &AgentIdentifier) -> Result<AgentTemplate> {
            Ok(AgentTemplate {
                identifier: identifier.clone(),
                system_prompt_template: "You help with {{ task }}.".into(),
                tool_names: vec!["task_completed".into()],
                spawnable_agents: vec![],
                default_max_steps: 5,
            })
        }
    }

    fn make_orchestrator() -> AgentOrchestrator {
        let mut registry = ToolRegistry::new();
        crate::builtin_tools::register_builtin_tools(&mut registry);

        let ports = OrchestratorPorts {
            llm: Arc::new(OneShotLlm),
            tool_client: None,
            template_source: Arc::new(FixedTemplate),
            credit_gate: Arc::new(CreditGate::new(Arc::new(InfiniteBalance), StdHashSet::new())),
            telemetry: Arc::new(NullTelemetrySink),
            clock: Arc::new(SystemClock),
            id_gen: Arc::new(UuidGen),
            env: Arc::new(SystemEnv),
        };

        AgentOrchestrator::new(ports, registry, OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn run_completes_when_task_completed_is_called() {
        let orchestrator = make_orchestrator();
        let context = RunContext {
            run_id: "run_1".into(),
            parent_run_id: None,
            credit_account: "acct_1".into(),
            max_steps: 10,
            max_spawn_depth: 2,
            depth: 0,
        };
        let output = orchestrator
            .run("coder".parse().unwrap(), "fix the bug", context, Arc::new(AtomicBool::new(false)))
            .await
            .expect("run");

        assert_eq!(output.terminal, Terminal::Completed);
        assert_eq!(output.steps_executed, 1);
        assert_eq!(output.credits_used, 1);
    }

    #[tokio::test]
    async fn run_stops_at_max_steps_without_ending_tool() {
        struct NeverEndsLlm;
        #[async_trait]
        impl LlmPort for NeverEndsLlm {
            async fn stream(
                &self,
                _request: LlmRequest,
            ) -> Result<futures::stream::BoxStream<'static, LlmEvent>> {
                Ok(Box::pin(stream::iter(vec![
                    LlmEvent::TextDelta("thinking...".into()),
                    LlmEvent::End { message_id: None, usage: None },
                ])))
            }
        }

        let mut registry = ToolRegistry::new();
        crate::builtin_tools::register_builtin_tools(&mut registry);
        let ports = OrchestratorPorts {
            llm: Arc::new(NeverEndsLlm),
            tool_client: None,
            template_source: Arc::new(FixedTemplate),
            credit_gate: Arc::new(CreditGate::new(Arc::new(InfiniteBalance), StdHashSet::new())),
            telemetry: Arc::new(NullTelemetrySink),
            clock: Arc::new(SystemClock),
            id_gen: Arc::new(UuidGen),
            env: Arc::new(SystemEnv),
        };
        let orchestrator = AgentOrchestrator::new(ports, registry, OrchestratorConfig::default());

        let context = RunContext {
            run_id: "run_1".into(),
            parent_run_id: None,
            credit_account: "acct_1".into(),
            max_steps: 2,
            max_spawn_depth: 2,
            depth: 0,
        };
        let output = orchestrator
            .run("coder".parse().unwrap(), "loop", context, Arc::new(AtomicBool::new(false)))
            .await
            .expect("run");

        assert_eq!(output.terminal, Terminal::MaxSteps);
        assert_eq!(output.steps_executed, 2);
    }

    #[tokio::test]
    async fn out_of_credits_halts_before_preflight_passes() {
        struct NoBalance;
        #[async_trait]
        impl CreditBackend for NoBalance {
            async fn balance(&self, _user: &str) -> std::result::Result<Balance, CreditBackendError> {
                Ok(Balance { amount: 0 })
            }
            async fn settle(
                &self,
                _user: &str,
                _amount: i64,
                _operation_id: &str,
            ) -> std::result::Result<(), CreditBackendError> {
                Ok(())
            }
        }

        let mut registry = ToolRegistry::new();
        crate::builtin_tools::register_builtin_tools(&mut registry);
        let ports = OrchestratorPorts {
            llm: Arc::new(OneShotLlm),
            tool_client: None,
            template_source: Arc::new(FixedTemplate),
            credit_gate: Arc::new(CreditGate::new(Arc::new(NoBalance), StdHashSet::new())),
            telemetry: Arc::new(NullTelemetrySink),
            clock: Arc::new(SystemClock),
            id_gen: Arc::new(UuidGen),
            env: Arc::new(SystemEnv),
        };
        let orchestrator = AgentOrchestrator::new(ports, registry, OrchestratorConfig::default());

        let context = RunContext {
            run_id: "run_1".into(),
            parent_run_id: None,
            credit_account: "acct_1".into(),
            max_steps: 10,
            max_spawn_depth: 2,
            depth: 0,
        };
        let result = orchestrator
            .run("coder".parse().unwrap(), "fix", context, Arc::new(AtomicBool::new(false)))
            .await;

        assert!(matches!(result, Err(AgentError::OutOfCredits { .. })));
    }
}
