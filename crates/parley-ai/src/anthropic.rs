use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

use parley_core::errors::ProviderError;
use parley_core::ids::ToolCallId;
use parley_core::message::{TokenUsage, ToolCall};
use parley_core::provider::{ChatProvider, GenerateOptions, ProviderReply, ProviderTurn};
use parley_core::tools::ToolDefinition;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AnthropicProvider {
    client: Client,
    api_key: SecretString,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        Ok(Self { client, api_key })
    }

    fn build_body(
        turns: &[ProviderTurn],
        system_prompt: Option<&str>,
        model: &str,
        options: &GenerateOptions,
    ) -> Value {
        let mut body = json!({
            "model": model,
            "max_tokens": options.max_tokens,
            "messages": turns_to_messages(turns),
        });

        if let Some(system) = system_prompt {
            body["system"] = json!(system);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if !options.tools.is_empty() {
            body["tools"] = json!(options
                .tools
                .iter()
                .map(tool_to_value)
                .collect::<Vec<Value>>());
        }

        body
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, turns, system_prompt, options), fields(model = %model))]
    async fn generate(
        &self,
        turns: &[ProviderTurn],
        system_prompt: Option<&str>,
        model: &str,
        options: &GenerateOptions,
    ) -> Result<ProviderReply, ProviderError> {
        let body = Self::build_body(turns, system_prompt, model, options);

        let resp = self
            .client
            .post(API_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(REQUEST_TIMEOUT)
                } else {
                    ProviderError::NetworkError(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let message: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        parse_reply(message)
    }
}

/// Map provider turns to the Anthropic messages array. Tool results go
/// back as user-role `tool_result` content blocks.
fn turns_to_messages(turns: &[ProviderTurn]) -> Vec<Value> {
    turns
        .iter()
        .map(|turn| match turn {
            ProviderTurn::User { content } => json!({
                "role": "user",
                "content": content,
            }),
            ProviderTurn::Assistant { content, tool_calls } => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(text) = content {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id.as_str(),
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                json!({"role": "assistant", "content": blocks})
            }
            ProviderTurn::Tool { tool_call_id, content } => json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": tool_call_id.as_str(),
                    "content": content,
                }],
            }),
        })
        .collect()
}

fn tool_to_value(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters_schema,
    })
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<UsageBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct UsageBlock {
    input_tokens: u32,
    output_tokens: u32,
}

fn parse_reply(message: MessagesResponse) -> Result<ProviderReply, ProviderError> {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in message.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: ToolCallId::from_raw(id),
                name,
                arguments: input,
            }),
            ContentBlock::Other => {}
        }
    }

    if text_parts.is_empty() && tool_calls.is_empty() {
        return Err(ProviderError::MalformedResponse(
            "response contained no text or tool_use blocks".into(),
        ));
    }

    let content = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join("\n"))
    };

    Ok(ProviderReply {
        content,
        tool_calls,
        usage: message.usage.map(|u| TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }),
    })
}
