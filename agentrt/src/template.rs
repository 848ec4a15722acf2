//! The template assembler (component C9).
//!
//! Resolves an [`AgentIdentifier`] to an [`AgentTemplate`] through a
//! [`TemplateSource`] port, caching the result so repeated runs of the same
//! agent (including sibling children spawned in the same step) don't
//! refetch it. The cache has single-writer semantics per identifier: a read
//! miss takes a write lock and inserts only if another concurrent resolver
//! didn't win the race first.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::message::Message;
use crate::ports::TemplateSource;
use crate::state::AgentIdentifier;
use crate::tool::ToolDescriptor;

/// A resolved agent definition: its system prompt template, the tools it is
/// allowed to call, and the agents it may spawn.
#[derive(Clone)]
pub struct AgentTemplate {
    /// The identifier this template was resolved for.
    pub identifier: AgentIdentifier,
    /// A minijinja source template for the system prompt.
    pub system_prompt_template: String,
    /// Names of tools (already registered in the caller's [`crate::tool::ToolRegistry`])
    /// this agent may call.
    pub tool_names: Vec<String>,
    /// Agent identifiers this agent is allowed to spawn via `spawn_agents`.
    pub spawnable_agents: Vec<AgentIdentifier>,
    /// Step budget for runs of this template, unless the caller overrides it.
    pub default_max_steps: u32,
}

impl std::fmt::Debug for AgentTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTemplate")
            .field("identifier", &self.identifier)
            .field("tool_names", &self.tool_names)
            .field("spawnable_agents", &self.spawnable_agents)
            .field("default_max_steps", &self.default_max_steps)
            .finish_non_exhaustive()
    }
}

impl AgentTemplate {
    /// Render the system prompt with `context` (e.g. `{"task": "..."}`).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AgentError::Internal`] if the template fails
    /// to parse or render.
    pub fn render_system_prompt(&self, context: &Value) -> Result<String> {
        let mut env = minijinja::Environment::new();
        env.add_template("system", &self.system_prompt_template)
            .map_err(|e| crate::error::AgentError::Internal(format!("template parse error: {e}")))?;
        let tmpl = env
            .get_template("system")
            .map_err(|e| crate::error::AgentError::Internal(e.to_string()))?;
        tmpl.render(context)
            .map_err(|e| crate::error::AgentError::Internal(format!("template render error: {e}")))
    }

    /// Build the initial message log seed for a fresh run of this template.
    #[must_use]
    pub fn seed_messages(&self, system_prompt: String, task: &str) -> Vec<Message> {
        vec![Message::system(system_prompt), Message::user(task)]
    }

    /// Whether `identifier` is in this template's spawn allowlist.
    #[must_use]
    pub fn can_spawn(&self, identifier: &AgentIdentifier) -> bool {
        self.spawnable_agents.iter().any(|a| a == identifier)
    }
}

/// Resolves and caches [`AgentTemplate`]s.
pub struct TemplateAssembler {
    source: Arc<dyn TemplateSource>,
    cache: RwLock<HashMap<String, AgentTemplate>>,
}

impl TemplateAssembler {
    /// Build an assembler backed by `source`.
    #[must_use]
    pub fn new(source: Arc<dyn TemplateSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `identifier`, consulting (and populating) the cache.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AgentError::UnknownAgent`] if the source
    /// cannot resolve the identifier.
    pub async fn resolve(&self, identifier: &AgentIdentifier) -> Result<AgentTemplate> {
        let key = identifier.to_string();

        if let Some(template) = self.cache.read().await.get(&key) {
            return Ok(template.clone());
        }

        let fetched = self.source.fetch(identifier).await?;

        let mut guard = self.cache.write().await;
        let template = guard.entry(key).or_insert(fetched).clone();
        Ok(template)
    }

    /// Attach a set of already-constructed tool descriptors to a resolved
    /// template's registry view. Kept separate from `resolve` because tool
    /// implementations are process-local (closures, client ports) and
    /// cannot themselves be cached or fetched from a remote source.
    #[must_use]
    pub fn select_tools<'a>(
        template: &AgentTemplate,
        all_tools: &'a crate::tool::ToolRegistry,
    ) -> Vec<&'a ToolDescriptor> {
        template
            .tool_names
            .iter()
            .filter_map(|name| all_tools.get(name))
            .collect()
    }
}
