use serde::{Deserialize, Serialize};

/// Tool definition sent to the provider alongside the prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// The single tool the assistant may invoke: hand the conversation over to
/// a human agent.
pub const ESCALATION_TOOL_NAME: &str = "escalate_to_human_agent";

pub fn escalation_tool() -> ToolDefinition {
    ToolDefinition {
        name: ESCALATION_TOOL_NAME.to_string(),
        description: "Escalate this conversation to a human support agent when the user \
                      explicitly asks for a human, is angry or distressed, or the request \
                      cannot be resolved by the assistant."
            .to_string(),
        parameters_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Short explanation of why a human is needed"
                },
                "urgency": {
                    "type": "string",
                    "enum": ["low", "medium", "high"],
                    "description": "How quickly an agent should pick this up"
                }
            },
            "required": ["reason"]
        }),
    }
}
