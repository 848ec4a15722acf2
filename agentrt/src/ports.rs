//! External ports (component C8).
//!
//! Everything the runtime needs that crosses a process boundary - calling an
//! LLM, dispatching a client-delegated tool, spawning a child agent,
//! recording telemetry, charging credits, resolving a template, generating
//! ids, and reading the clock - is expressed as a trait here and injected at
//! [`crate::orchestrator::AgentOrchestrator::new`]. Core logic never reads
//! the environment, the filesystem, or the network directly.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::Result;
use crate::message::OutputPart;
use crate::state::AgentIdentifier;
use crate::stream::LlmEvent;
use crate::template::AgentTemplate;
use crate::usage::Usage;

/// Milliseconds since the Unix epoch, as returned by [`Clock::now`].
///
/// A newtype rather than a bare `i64` so that call sites can't accidentally
/// mix it up with a duration or a step index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Injected source of the current time, so step timing and telemetry
/// timestamps are reproducible in tests.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> Timestamp;
}

/// Production [`Clock`] backed by [`std::time::SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        Timestamp(millis)
    }
}

/// Injected source of fresh ids (tool-call ids, run ids, operation ids), so
/// property tests can run with predictable identifiers.
pub trait IdGen: Send + Sync {
    /// Generate a fresh id. `purpose` is a short tag (e.g. `"run"`,
    /// `"tool_call"`) some implementations use as an id prefix; it carries no
    /// semantic meaning to callers.
    fn new_id(&self, purpose: &str) -> String;
}

/// Production [`IdGen`] backed by UUID v4.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn new_id(&self, purpose: &str) -> String {
        format!("{purpose}_{}", uuid::Uuid::new_v4())
    }
}

/// One request to the language model.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Rendered system prompt.
    pub system: String,
    /// Conversation history to send, already flattened to whatever wire
    /// format the port's underlying provider expects is the port's own
    /// concern; callers pass the runtime's own [`crate::message::Message`]
    /// history.
    pub history: Vec<crate::message::Message>,
    /// Names and schemas of tools available this step.
    pub tool_definitions: Vec<crate::tool::ToolDefinition>,
}

/// The LLM port: turns one request into a stream of [`LlmEvent`]s.
#[async_trait]
pub trait LlmPort: Send + Sync {
    /// Begin streaming a completion for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AgentError::LlmTransport`] if the request
    /// could not be sent or the stream could not be established.
    async fn stream(&self, request: LlmRequest) -> Result<BoxStream<'static, LlmEvent>>;
}

/// One client-delegated tool invocation, handed to [`ToolClientPort`].
#[derive(Debug, Clone)]
pub struct ClientToolCall {
    /// The tool-call id.
    pub id: String,
    /// The tool name.
    pub name: String,
    /// The tool's input.
    pub input: Value,
}

/// The tool client port: dispatches a tool call to a host-controlled
/// surface (e.g. an IDE extension) that executes outside the runtime's own
/// process.
#[async_trait]
pub trait ToolClientPort: Send + Sync {
    /// Execute `call` on the host side and return its output parts.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AgentError::ToolHandlerError`] if the host
    /// reports a failure. Cancellation behavior for an in-flight call is
    /// host-dependent; see `DESIGN.md`.
    async fn dispatch(&self, call: ClientToolCall) -> Result<Vec<OutputPart>>;
}

/// A request to spawn one child agent run, built from one entry of a
/// `spawn_agents` call's `agents` list.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// The child's agent identifier.
    pub agent: AgentIdentifier,
    /// The prompt/task handed to the child.
    pub prompt: String,
    /// Extra structured parameters handed to the child alongside `prompt`,
    /// e.g. when the `spawnableAgents` compatibility shim rewrites a direct
    /// call into a spawn request and carries the original call's input
    /// along as `params`.
    pub params: Option<Value>,
    /// Whether the parent awaits this child (`sync`) or fires it and
    /// continues (`async`).
    pub sync: bool,
}

impl SpawnRequest {
    /// The prompt text to actually hand the child, folding `params` in as
    /// trailing JSON context when present.
    #[must_use]
    pub fn effective_prompt(&self) -> String {
        match &self.params {
            Some(params) if !params.is_null() => format!("{}\n\nParameters: {params}", self.prompt),
            _ => self.prompt.clone(),
        }
    }
}

/// The outcome of one spawned child, reported back to the parent.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    /// The child's own run id.
    pub run_id: String,
    /// The child's final assistant text, if it completed normally.
    pub output: Option<String>,
    /// Credits consumed by the child (and transitively, its own children).
    pub credits_used: i64,
    /// The child's terminal state, as a short tag (`"completed"`,
    /// `"max_steps"`, `"aborted"`, `"error"`, `"out_of_credits"`).
    pub terminal: String,
}

/// The spawn-child port: runs a child agent to completion (or to
/// fire-and-forget dispatch, for async spawns) and reports its outcome.
///
/// The default production implementation is the orchestrator itself,
/// recursing into a fresh [`crate::orchestrator::AgentOrchestrator::run`]
/// call; it is expressed as a port so tests can substitute a stub and so a
/// host may run children out-of-process.
#[async_trait]
pub trait SpawnChildPort: Send + Sync {
    /// Spawn one child per `request`.
    ///
    /// # Errors
    ///
    /// Propagates whatever error the child run terminated with, for sync
    /// spawns; async spawns report their outcome out of band and this
    /// method returns once the child has been scheduled.
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnOutcome>;
}

/// A telemetry record emitted when a run begins.
#[derive(Debug, Clone)]
pub struct RunStarted {
    /// The run's id.
    pub run_id: String,
    /// The agent identifier being run.
    pub agent: AgentIdentifier,
    /// The parent run's id, if this is a spawned child.
    pub parent_run_id: Option<String>,
    /// The deployment's environment tag, from [`EnvPort::env_tag`].
    pub env_tag: String,
    /// When the run started.
    pub started_at: Timestamp,
}

/// A telemetry record emitted after each step commits.
#[derive(Debug, Clone)]
pub struct StepRecorded {
    /// The run's id.
    pub run_id: String,
    /// The step index (0-based).
    pub step_index: u32,
    /// Tool calls dispatched this step.
    pub tool_call_count: usize,
    /// Whether any call this step was rejected as unknown or schema-invalid.
    pub had_tool_call_error: bool,
    /// Token usage for this step, if reported.
    pub usage: Option<Usage>,
    /// Credits charged for this step.
    pub credits_charged: i64,
}

/// A telemetry record emitted when a run terminates.
#[derive(Debug, Clone)]
pub struct RunFinished {
    /// The run's id.
    pub run_id: String,
    /// The terminal state, as a short tag.
    pub terminal: String,
    /// Total credits used across the run.
    pub credits_used: i64,
    /// When the run finished.
    pub finished_at: Timestamp,
}

/// The telemetry sink: receives structured records at run/step boundaries.
/// Implementations are expected to be cheap and non-blocking (buffering or
/// fire-and-forget), since the orchestrator calls these inline.
pub trait TelemetrySink: Send + Sync {
    /// A run began.
    fn start_run(&self, record: RunStarted);
    /// A step committed.
    fn add_step(&self, record: StepRecorded);
    /// A run reached a terminal state.
    fn finish_run(&self, record: RunFinished);
}

/// A [`TelemetrySink`] that discards every record, for tests and callers
/// that don't care.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn start_run(&self, _record: RunStarted) {}
    fn add_step(&self, _record: StepRecorded) {}
    fn finish_run(&self, _record: RunFinished) {}
}

/// A backend error code the credit gate inspects to decide whether a
/// `settle` call is worth retrying. Named for transaction-conflict
/// conditions in general rather than any one database's error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CreditBackendErrorCode {
    /// Transaction serialization failure (optimistic concurrency conflict).
    SerializationFailure,
    /// Deadlock detected.
    Deadlock,
    /// Connection dropped mid-transaction.
    ConnectionException,
    /// The backend timed out or is shutting down.
    TimeoutOrShutdown,
    /// The backend is out of connections or memory.
    TooManyConnectionsOrOom,
    /// Any other backend failure; not retried.
    Other,
}

impl CreditBackendErrorCode {
    /// Whether the credit gate should retry a `settle` call that failed with
    /// this code.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// A failure reported by [`CreditBackend::settle`].
#[derive(Debug, Clone)]
pub struct CreditBackendError {
    /// The backend error code.
    pub code: CreditBackendErrorCode,
    /// A human-readable message.
    pub message: String,
}

impl fmt::Display for CreditBackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for CreditBackendError {}

/// The outcome of a balance check.
#[derive(Debug, Clone, Copy)]
pub struct Balance {
    /// The account's current balance, in the backend's credit units.
    pub amount: i64,
}

/// The credit backend: the transactional ledger [`crate::credit::CreditGate`]
/// settles against. `settle` must be idempotent on `operation_id` (property
/// P-IDEMPOTENT-SETTLE): calling it twice with the same id has the same
/// effect as calling it once.
#[async_trait]
pub trait CreditBackend: Send + Sync {
    /// Read the current balance for `user`.
    async fn balance(&self, user: &str) -> std::result::Result<Balance, CreditBackendError>;

    /// Debit `amount` from `user`'s balance under `operation_id`. Calling
    /// this twice with the same `operation_id` must not double-charge.
    async fn settle(
        &self,
        user: &str,
        amount: i64,
        operation_id: &str,
    ) -> std::result::Result<(), CreditBackendError>;
}

/// The template source: resolves an [`AgentIdentifier`] to an
/// [`AgentTemplate`], e.g. by fetching from a registry service. Results are
/// cached by [`crate::template::TemplateAssembler`], so implementations need
/// not cache internally.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Fetch the template for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AgentError::UnknownAgent`] if no template
    /// matches.
    async fn fetch(&self, identifier: &AgentIdentifier) -> Result<AgentTemplate>;
}

/// Deployment configuration and secrets the runtime needs but never reads
/// itself: provider API keys, the environment tag attached to telemetry,
/// and a base URL override for outbound requests. Construction-time wiring
/// (`AgentOrchestrator::new`) is the only place allowed to touch this; core
/// logic never calls `std::env` directly.
pub trait EnvPort: Send + Sync {
    /// The API key for `provider` (e.g. `"openai"`, `"anthropic"`), if
    /// configured.
    fn api_key(&self, provider: &str) -> Option<String>;

    /// The deployment's environment tag (e.g. `"production"`, `"staging"`).
    fn env_tag(&self) -> String;

    /// Base URL override for `provider`'s outbound requests, if the
    /// deployment doesn't use the provider's default endpoint.
    fn base_url(&self, provider: &str) -> Option<String>;
}

/// Production [`EnvPort`] backed by `std::env`, reading
/// `<PROVIDER>_API_KEY` / `<PROVIDER>_BASE_URL` and `AGENTRT_ENV`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl EnvPort for SystemEnv {
    fn api_key(&self, provider: &str) -> Option<String> {
        std::env::var(format!("{}_API_KEY", provider.to_uppercase())).ok()
    }

    fn env_tag(&self) -> String {
        std::env::var("AGENTRT_ENV").unwrap_or_else(|_| "production".to_owned())
    }

    fn base_url(&self, provider: &str) -> Option<String> {
        std::env::var(format!("{}_BASE_URL", provider.to_uppercase())).ok()
    }
}
