use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::ids::ToolCallId;
use crate::message::{TokenUsage, ToolCall};
use crate::tools::ToolDefinition;

/// One turn of the prompt sent to a provider, reconstructed from the
/// persisted conversation history.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderTurn {
    User { content: String },
    Assistant { content: Option<String>, tool_calls: Vec<ToolCall> },
    Tool { tool_call_id: ToolCallId, content: String },
}

impl ProviderTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User { content: content.into() }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant { content: Some(content.into()), tool_calls: Vec::new() }
    }

    pub fn tool(tool_call_id: ToolCallId, content: impl Into<String>) -> Self {
        Self::Tool { tool_call_id, content: content.into() }
    }
}

/// What a provider returned for one generation. `content` may be absent
/// when the assistant only requested tool execution.
#[derive(Clone, Debug, Default)]
pub struct ProviderReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ProviderReply {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Options controlling a single generation.
#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Tool definitions offered to the model. Empty ⇒ plain text reply.
    pub tools: Vec<ToolDefinition>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: None,
            tools: Vec::new(),
        }
    }
}

/// Trait implemented by each chat provider (Anthropic, OpenAI, mock).
/// A single capability: turn a reconstructed history into one reply.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        turns: &[ProviderTurn],
        system_prompt: Option<&str>,
        model: &str,
        options: &GenerateOptions,
    ) -> Result<ProviderReply, ProviderError>;
}
