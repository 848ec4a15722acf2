//! Error taxonomy for the agent runtime.
//!
//! Every failure the runtime produces carries one of the [`ErrorKind`]
//! values so that callers (and the orchestrator itself) can decide whether
//! a failure is inline-recoverable, step-terminal, or run-terminal.

use thiserror::Error;

/// A type alias for `Result<T, AgentError>`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// The runtime's error type.
///
/// The runtime never panics or throws across the orchestrator boundary:
/// every failure eventually becomes either an inline message-log entry or
/// one of these variants surfaced as a structured [`crate::orchestrator::AgentOutput`].
#[derive(Debug, Error)]
pub enum AgentError {
    /// Dispatcher: a parsed tool call named a tool absent from the registry
    /// and not resolvable via the `spawnableAgents` compatibility shim.
    #[error("unknown tool '{name}'")]
    ToolUnknown {
        /// The tool name the model emitted.
        name: String,
    },

    /// Dispatcher: the tool call's `input` failed schema validation.
    #[error("invalid parameters for {tool_name}: {message}")]
    ToolInputInvalid {
        /// Name of the tool whose input failed validation.
        tool_name: String,
        /// Human-readable validation failure.
        message: String,
    },

    /// A tool handler returned an error, or the delegated client port
    /// returned one on its behalf.
    #[error("tool '{tool_name}' failed: {message}")]
    ToolHandlerError {
        /// Name of the tool that failed.
        tool_name: String,
        /// The underlying error message.
        message: String,
    },

    /// The LLM port failed after exhausting its own retries.
    #[error("LLM transport error: {0}")]
    LlmTransport(String),

    /// The credit gate reported an insufficient balance.
    #[error("out of credits (balance: {balance})")]
    OutOfCredits {
        /// The account balance at the time of the check, if known.
        balance: i64,
    },

    /// The run (or an ancestor) was aborted.
    #[error("aborted")]
    Aborted,

    /// `MessageLog::commit` would have produced a log with a pairing,
    /// adjacency, or orphaned-result violation.
    #[error("internal invariant breach: {0}")]
    InvariantBreach(String),

    /// `TemplateAssembler` could not resolve an agent identifier.
    #[error("unknown agent template '{0}'")]
    UnknownAgent(String),

    /// Agent identifier failed to parse.
    #[error("malformed agent identifier '{0}'")]
    MalformedAgentIdentifier(String),

    /// JSON (de)serialization failure outside the tool-input-validation path.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else - configuration mistakes, port misuse, etc.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Classify this error into its [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolUnknown { .. } => ErrorKind::ToolUnknown,
            Self::ToolInputInvalid { .. } => ErrorKind::ToolInputInvalid,
            Self::ToolHandlerError { .. } => ErrorKind::ToolHandlerError,
            Self::LlmTransport(_) => ErrorKind::LlmTransport,
            Self::OutOfCredits { .. } => ErrorKind::OutOfCredits,
            Self::Aborted => ErrorKind::Aborted,
            Self::InvariantBreach(_) => ErrorKind::InvariantBreach,
            Self::UnknownAgent(_) | Self::MalformedAgentIdentifier(_) => ErrorKind::UnknownAgent,
            Self::Json(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message shown inline to the model when a tool call fails without
    /// ending the step: "Error during tool call: `<msg>`. Please check the
    /// tool name and arguments and try again."
    #[must_use]
    pub fn inline_message(&self) -> String {
        format!(
            "Error during tool call: {self}. Please check the tool name and arguments and try again."
        )
    }
}

/// The error taxonomy used to decide recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Dispatcher: name not in registry and not spawnable.
    ToolUnknown,
    /// Dispatcher: schema validation failed.
    ToolInputInvalid,
    /// Handler threw, or the delegated port returned an error.
    ToolHandlerError,
    /// LLM port error.
    LlmTransport,
    /// Credit gate reported insufficient balance.
    OutOfCredits,
    /// User (or ancestor) abort.
    Aborted,
    /// Commit-time log invariant violated.
    InvariantBreach,
    /// Template resolution failed.
    UnknownAgent,
    /// Anything uncategorized.
    Internal,
}
