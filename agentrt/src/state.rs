//! Agent identity and per-run state: `AgentState`, `RunContext`, and the
//! agent identifier syntax.

use std::fmt;
use std::str::FromStr;

use crate::error::AgentError;
use crate::log::MessageLog;

/// An agent identifier: `[<publisher>/]<id>[@<version>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentIdentifier {
    /// The publisher namespace, if qualified.
    pub publisher: Option<String>,
    /// The agent's bare id.
    pub id: String,
    /// The requested version, if pinned.
    pub version: Option<String>,
}

impl AgentIdentifier {
    /// Construct an identifier directly from parts.
    #[must_use]
    pub fn new(publisher: Option<String>, id: impl Into<String>, version: Option<String>) -> Self {
        Self {
            publisher,
            id: id.into(),
            version,
        }
    }
}

impl fmt::Display for AgentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(publisher) = &self.publisher {
            write!(f, "{publisher}/")?;
        }
        write!(f, "{}", self.id)?;
        if let Some(version) = &self.version {
            write!(f, "@{version}")?;
        }
        Ok(())
    }
}

impl FromStr for AgentIdentifier {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AgentError::MalformedAgentIdentifier(s.to_owned()));
        }

        let (rest, version) = match s.split_once('@') {
            Some((rest, version)) if !version.is_empty() => (rest, Some(version.to_owned())),
            Some(_) => return Err(AgentError::MalformedAgentIdentifier(s.to_owned())),
            None => (s, None),
        };

        let (publisher, id) = match rest.split_once('/') {
            Some((publisher, id)) if !publisher.is_empty() && !id.is_empty() => {
                (Some(publisher.to_owned()), id)
            }
            Some(_) => return Err(AgentError::MalformedAgentIdentifier(s.to_owned())),
            None => (None, rest),
        };

        if id.is_empty() {
            return Err(AgentError::MalformedAgentIdentifier(s.to_owned()));
        }

        Ok(Self {
            publisher,
            id: id.to_owned(),
            version,
        })
    }
}

/// The ancestry and budget context a single run executes under.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// This run's id.
    pub run_id: String,
    /// The parent run's id, if this run was spawned as a child.
    pub parent_run_id: Option<String>,
    /// The account credits are charged against.
    pub credit_account: String,
    /// Maximum number of steps this run may take.
    pub max_steps: u32,
    /// Maximum nesting depth for further `spawn_agents` calls from this run.
    pub max_spawn_depth: u32,
    /// This run's depth in the spawn hierarchy (0 for a top-level run).
    pub depth: u32,
}

impl RunContext {
    /// Build the context for a child spawned from this one.
    #[must_use]
    pub fn child(&self, run_id: String) -> Self {
        Self {
            run_id,
            parent_run_id: Some(self.run_id.clone()),
            credit_account: self.credit_account.clone(),
            max_steps: self.max_steps,
            max_spawn_depth: self.max_spawn_depth,
            depth: self.depth + 1,
        }
    }

    /// Whether this run is permitted to spawn further children.
    #[must_use]
    pub const fn can_spawn(&self) -> bool {
        self.depth < self.max_spawn_depth
    }
}

/// The full mutable state of one agent run: its message log, the context it
/// runs under, and its running totals.
#[derive(Debug)]
pub struct AgentState {
    /// The agent identifier this state was instantiated from.
    pub identifier: AgentIdentifier,
    /// The conversation log.
    pub log: MessageLog,
    /// The run's ancestry/budget context.
    pub context: RunContext,
    /// This run's own charges, excluding anything aggregated up from
    /// children. `credits_used == direct_credits_used + sum of finished
    /// children's `credits_used`.
    pub direct_credits_used: i64,
    /// Total credits consumed so far: this run's own steps plus every
    /// child (sync or async) that has reported back in.
    pub credits_used: i64,
    /// Run ids of every child this run has spawned, in spawn order.
    pub spawned_child_run_ids: Vec<String>,
    /// The index of the next step to execute.
    pub step_index: u32,
}

impl AgentState {
    /// Start a fresh run.
    #[must_use]
    pub fn new(identifier: AgentIdentifier, log: MessageLog, context: RunContext) -> Self {
        Self {
            identifier,
            log,
            context,
            direct_credits_used: 0,
            credits_used: 0,
            spawned_child_run_ids: Vec::new(),
            step_index: 0,
        }
    }
}
