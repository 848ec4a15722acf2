//! The tool registry (component C2).
//!
//! A [`ToolDescriptor`] pairs a name and JSON-schema'd input contract with
//! one of three handler flavors: an in-process [`Tool`] implementation, a
//! client-delegated call forwarded to [`crate::ports::ToolClientPort`], or a
//! spawning call that starts a child agent run. The [`ToolDispatcher`]
//! (component C4, in `dispatch.rs`) is the only consumer that invokes a
//! descriptor's handler; this module only describes and stores tools.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::message::OutputPart;

/// The result of calling an in-process [`Tool`].
pub type ToolOutput = Vec<OutputPart>;

/// Wrap a `#[tool]`-macro-generated function's return value as a single
/// [`ToolOutput`] part: a bare string becomes [`OutputPart::Text`], anything
/// else is serialized as [`OutputPart::Json`].
#[must_use]
pub fn to_tool_output<T: Serialize>(value: &T) -> ToolOutput {
    match serde_json::to_value(value) {
        Ok(Value::String(text)) => vec![OutputPart::Text { value: text }],
        Ok(json) => vec![OutputPart::Json { value: json }],
        Err(err) => vec![OutputPart::ErrorText {
            value: format!("failed to serialize tool output: {err}"),
        }],
    }
}

/// An in-process tool implementation.
///
/// Object-safe by construction (a single JSON in, JSON-ish out method), so
/// both hand-written tools and `#[tool]`-macro-generated ones can be stored
/// behind one `Arc<dyn Tool>` in the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Execute the tool against already-validated `input`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ToolHandlerError`] if execution fails; the
    /// dispatcher turns this into an `error-text`/`error-json` output part
    /// rather than aborting the step.
    async fn call(&self, input: Value) -> Result<ToolOutput>;
}

/// A tool definition in the wire format handed to [`crate::ports::LlmPort`]
/// (the usual OpenAI-style function-calling shape: name, description, JSON
/// schema).
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// The tool's name.
    pub name: String,
    /// A human/model-readable description.
    pub description: String,
    /// JSON schema for the tool's input.
    pub parameters: Value,
}

/// How a [`ToolDescriptor`] is actually executed.
pub enum ToolHandler {
    /// Executed in-process by the runtime itself.
    InProcess(Arc<dyn Tool>),
    /// Forwarded to the host via [`crate::ports::ToolClientPort`].
    ClientDelegated,
    /// Starts a child agent run via [`crate::ports::SpawnChildPort`] (the
    /// `spawn_agents` tool and any agent exposed as a callable tool through
    /// the `spawnableAgents` compatibility shim).
    Spawning,
}

impl std::fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess(_) => f.write_str("ToolHandler::InProcess(..)"),
            Self::ClientDelegated => f.write_str("ToolHandler::ClientDelegated"),
            Self::Spawning => f.write_str("ToolHandler::Spawning"),
        }
    }
}

/// A registered tool: its contract plus how to run it.
#[derive(Debug)]
pub struct ToolDescriptor {
    /// The tool's name, as the model will reference it.
    pub name: String,
    /// A human/model-readable description.
    pub description: String,
    /// JSON schema the tool's input must validate against.
    pub input_schema: Value,
    /// Whether a successful call to this tool ends the current agent step
    /// (`task_completed`, `end_turn`, and any spawn-as-tool call with
    /// `sync: false` are the built-in examples).
    pub ends_agent_step: bool,
    /// Extracts a serialization key from a call's input, if this tool's
    /// effects must not interleave with another call sharing the same key
    /// (e.g. two writes to the same file path). `None` means calls to this
    /// tool never serialize against each other.
    pub serialization_key: Option<fn(&Value) -> Option<String>>,
    /// How the tool actually runs.
    pub handler: ToolHandler,
}

impl ToolDescriptor {
    /// The wire-format definition sent to the model.
    #[must_use]
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }

    /// Validate `input` against `input_schema`.
    ///
    /// Uses a small structural checker over the schema's declared
    /// `required` array and each property's declared `type`, rather than a
    /// full JSON Schema validator: descriptors only ever declare the
    /// object/string/number/boolean/array shapes `schemars` derives for
    /// tool argument structs, so this covers what the runtime actually
    /// needs to reject.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ToolInputInvalid`] on any mismatch.
    pub fn validate_input(&self, input: &Value) -> Result<()> {
        validate_against_schema(&self.name, &self.input_schema, input)
    }
}

fn validate_against_schema(tool_name: &str, schema: &Value, input: &Value) -> Result<()> {
    let invalid = |message: String| {
        Err(AgentError::ToolInputInvalid {
            tool_name: tool_name.to_owned(),
            message,
        })
    };

    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if schema_obj.get("type").and_then(Value::as_str) == Some("object") {
        let Some(input_obj) = input.as_object() else {
            return invalid("expected a JSON object".to_owned());
        };

        if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
            for field in required {
                let Some(field_name) = field.as_str() else {
                    continue;
                };
                if !input_obj.contains_key(field_name) {
                    return invalid(format!("missing required field '{field_name}'"));
                }
            }
        }

        if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
            for (key, value) in input_obj {
                if let Some(prop_schema) = properties.get(key) {
                    check_type(tool_name, key, prop_schema, value)?;
                }
            }
        }
    }

    Ok(())
}

fn check_type(tool_name: &str, field: &str, prop_schema: &Value, value: &Value) -> Result<()> {
    let Some(expected) = prop_schema.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    let matches = match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    };
    if matches {
        Ok(())
    } else {
        Err(AgentError::ToolInputInvalid {
            tool_name: tool_name.to_owned(),
            message: format!("field '{field}' expected type '{expected}', got {value}"),
        })
    }
}

/// The collection of tools available to an agent during a step.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any existing entry with the same name.
    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Whether a tool with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All registered tool definitions, for inclusion in an [`crate::ports::LlmRequest`].
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(ToolDescriptor::definition).collect()
    }

    /// Iterate over all registered descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }
}
