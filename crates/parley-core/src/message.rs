use serde::{Deserialize, Serialize};

use crate::ids::{ParticipantId, ToolCallId};

/// Who produced a message. A closed variant set: only human senders carry
/// an identity, so an AI or system message cannot be attributed to a
/// participant by construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sender {
    User { id: ParticipantId },
    Agent { id: ParticipantId },
    Ia,
    Tool,
    System,
}

impl Sender {
    /// The participant identity behind the message, when there is one.
    pub fn participant_id(&self) -> Option<&ParticipantId> {
        match self {
            Self::User { id } | Self::Agent { id } => Some(id),
            Self::Ia | Self::Tool | Self::System => None,
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Self::User { .. } | Self::Agent { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    UserQuery,
    IaResponse,
    UserMessage,
    AgentMessage,
    ToolResult,
    SystemNotification,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserQuery => write!(f, "user_query"),
            Self::IaResponse => write!(f, "ia_response"),
            Self::UserMessage => write!(f, "user_message"),
            Self::AgentMessage => write!(f, "agent_message"),
            Self::ToolResult => write!(f, "tool_result"),
            Self::SystemNotification => write!(f, "system_notification"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_query" => Ok(Self::UserQuery),
            "ia_response" => Ok(Self::IaResponse),
            "user_message" => Ok(Self::UserMessage),
            "agent_message" => Ok(Self::AgentMessage),
            "tool_result" => Ok(Self::ToolResult),
            "system_notification" => Ok(Self::SystemNotification),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

impl MessageKind {
    /// Whether messages of this kind feed back into the AI prompt when the
    /// conversation history is reconstructed.
    pub fn is_prompt_relevant(&self) -> bool {
        matches!(self, Self::UserQuery | Self::IaResponse | Self::ToolResult)
    }
}

/// A structured tool invocation requested by the assistant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Token accounting reported by a provider for one generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
