//! The runtime's built-in tools: the two step-ending signals every template
//! gets for free (`task_completed`, `end_turn`) and the `spawn_agents` tool
//! that fans a step out into child runs.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::message::OutputPart;
use crate::tool::{Tool, ToolDescriptor, ToolHandler, ToolOutput, ToolRegistry};

struct TaskCompleted;

#[async_trait]
impl Tool for TaskCompleted {
    async fn call(&self, input: Value) -> Result<ToolOutput> {
        let summary = input
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(vec![OutputPart::text(summary.to_owned())])
    }
}

struct EndTurn;

#[async_trait]
impl Tool for EndTurn {
    async fn call(&self, _input: Value) -> Result<ToolOutput> {
        Ok(vec![OutputPart::text(String::new())])
    }
}

/// Register `task_completed`, `end_turn`, and `spawn_agents` into `registry`.
/// Every template implicitly has access to these three regardless of its
/// own `tool_names` list.
pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register(ToolDescriptor {
        name: "task_completed".into(),
        description: "Signal that the assigned task is finished.".into(),
        input_schema: json!({
            "type": "object",
            "properties": { "summary": { "type": "string" } },
            "required": ["summary"],
        }),
        ends_agent_step: true,
        serialization_key: None,
        handler: ToolHandler::InProcess(std::sync::Arc::new(TaskCompleted)),
    });

    registry.register(ToolDescriptor {
        name: "end_turn".into(),
        description: "End the current turn without further tool calls.".into(),
        input_schema: json!({ "type": "object", "properties": {} }),
        ends_agent_step: true,
        serialization_key: None,
        handler: ToolHandler::InProcess(std::sync::Arc::new(EndTurn)),
    });

    registry.register(ToolDescriptor {
        name: "spawn_agents".into(),
        description: "Spawn one or more child agents to work on subtasks, in sync (await all) or async (fire and continue) mode.".into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "agents": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "agentType": { "type": "string" },
                            "prompt": { "type": "string" },
                            "params": {},
                        },
                        "required": ["agentType", "prompt"],
                    },
                },
                "sync": { "type": "boolean" },
            },
            "required": ["agents"],
        }),
        ends_agent_step: false,
        serialization_key: None,
        handler: ToolHandler::Spawning,
    });
}
