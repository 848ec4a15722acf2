//! Convenience re-exports of the types most callers need.
//!
//! ```rust
//! use agentrt::prelude::*;
//! ```

pub use crate::builtin_tools::register_builtin_tools;
pub use crate::credit::CreditGate;
pub use crate::dispatch::{DispatchCall, DispatchOutcome, StepEndSignal, ToolDispatcher};
pub use crate::error::{AgentError, ErrorKind, Result};
pub use crate::log::MessageLog;
pub use crate::message::{AssistantPart, Message, OutputPart, ToolCallId};
pub use crate::orchestrator::{
    AgentOrchestrator, AgentOutput, OrchestratorConfig, OrchestratorPorts, Terminal,
};
pub use crate::ports::{
    Balance, Clock, CreditBackend, CreditBackendError, CreditBackendErrorCode, EnvPort, IdGen,
    LlmPort, LlmRequest, NullTelemetrySink, SpawnChildPort, SpawnOutcome, SpawnRequest,
    SystemClock, SystemEnv, TelemetrySink, TemplateSource, Timestamp, ToolClientPort, UuidGen,
};
pub use crate::state::{AgentIdentifier, AgentState, RunContext};
pub use crate::step::{AgentStepRunner, StepOutcome, StepPhase};
pub use crate::stream::{LlmEvent, ParsedEvent, StreamOutcome, StreamParser, ToolCallSource};
pub use crate::template::{AgentTemplate, TemplateAssembler};
pub use crate::tool::{Tool, ToolDefinition, ToolDescriptor, ToolHandler, ToolOutput, ToolRegistry};

#[cfg(feature = "derive")]
pub use agentrt_derive::tool;
