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

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiProvider {
    client: Client,
    api_key: SecretString,
}

impl OpenAiProvider {
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
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(turns.iter().map(turn_to_message));

        let mut body = json!({
            "model": model,
            "max_tokens": options.max_tokens,
            "messages": messages,
        });

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
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
            .bearer_auth(self.api_key.expose_secret())
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

        let completion: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        parse_reply(completion)
    }
}

/// OpenAI carries tool arguments as a JSON-encoded string, so assistant
/// tool calls are serialized and tool results become `tool` role messages.
fn turn_to_message(turn: &ProviderTurn) -> Value {
    match turn {
        ProviderTurn::User { content } => json!({"role": "user", "content": content}),
        ProviderTurn::Assistant { content, tool_calls } => {
            let mut message = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                message["tool_calls"] = json!(tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id.as_str(),
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            },
                        })
                    })
                    .collect::<Vec<Value>>());
            }
            message
        }
        ProviderTurn::Tool { tool_call_id, content } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id.as_str(),
            "content": content,
        }),
    }
}

fn tool_to_value(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters_schema,
        },
    })
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageBlock>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Deserialize)]
struct RawToolCall {
    id: String,
    function: RawFunction,
}

#[derive(Deserialize)]
struct RawFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct UsageBlock {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn parse_reply(completion: CompletionResponse) -> Result<ProviderReply, ProviderError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedResponse("response contained no choices".into()))?;

    let mut tool_calls = Vec::with_capacity(choice.message.tool_calls.len());
    for raw in choice.message.tool_calls {
        let arguments: Value = serde_json::from_str(&raw.function.arguments).map_err(|e| {
            ProviderError::MalformedResponse(format!(
                "tool call {} carried unparseable arguments: {e}",
                raw.function.name
            ))
        })?;
        tool_calls.push(ToolCall {
            id: ToolCallId::from_raw(raw.id),
            name: raw.function.name,
            arguments,
        });
    }

    if choice.message.content.is_none() && tool_calls.is_empty() {
        return Err(ProviderError::MalformedResponse(
            "response contained neither content nor tool calls".into(),
        ));
    }

    Ok(ProviderReply {
        content: choice.message.content,
        tool_calls,
        usage: completion.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::tools::escalation_tool;

    #[test]
    fn provider_name() {
        let provider = OpenAiProvider::new(SecretString::from("test-key")).unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn body_puts_system_first_and_wraps_tools() {
        let turns = vec![ProviderTurn::user("hello")];
        let options = GenerateOptions {
            tools: vec![escalation_tool()],
            ..GenerateOptions::default()
        };
        let body = OpenAiProvider::build_body(&turns, Some("be helpful"), "gpt-4o", &options);

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(
            body["tools"][0]["function"]["name"],
            "escalate_to_human_agent"
        );
    }

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_string() {
        let turn = ProviderTurn::Assistant {
            content: None,
            tool_calls: vec![ToolCall {
                id: ToolCallId::from_raw("call_1"),
                name: "escalate_to_human_agent".into(),
                arguments: json!({"reason": "refund", "urgency": "low"}),
            }],
        };
        let message = turn_to_message(&turn);
        let arguments = message["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        let parsed: Value = serde_json::from_str(arguments).unwrap();
        assert_eq!(parsed["reason"], "refund");
    }

    #[test]
    fn tool_turn_maps_to_tool_role() {
        let turn = ProviderTurn::tool(ToolCallId::from_raw("call_2"), "done");
        let message = turn_to_message(&turn);
        assert_eq!(message["role"], "tool");
        assert_eq!(message["tool_call_id"], "call_2");
    }

    #[test]
    fn parse_text_reply() {
        let raw = json!({
            "choices": [{"message": {"content": "hi there"}}],
            "usage": {"prompt_tokens": 8, "completion_tokens": 3},
        });
        let completion: CompletionResponse = serde_json::from_value(raw).unwrap();
        let reply = parse_reply(completion).unwrap();
        assert_eq!(reply.content.as_deref(), Some("hi there"));
        assert_eq!(reply.usage.unwrap().input_tokens, 8);
    }

    #[test]
    fn parse_tool_call_reply_decodes_arguments() {
        let raw = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {
                        "name": "escalate_to_human_agent",
                        "arguments": "{\"reason\":\"locked out\",\"urgency\":\"high\"}",
                    },
                }],
            }}],
        });
        let completion: CompletionResponse = serde_json::from_value(raw).unwrap();
        let reply = parse_reply(completion).unwrap();
        assert!(reply.has_tool_calls());
        assert_eq!(reply.tool_calls[0].arguments["urgency"], "high");
    }

    #[test]
    fn parse_bad_arguments_is_malformed() {
        let raw = json!({
            "choices": [{"message": {
                "tool_calls": [{
                    "id": "call_10",
                    "type": "function",
                    "function": {"name": "escalate_to_human_agent", "arguments": "not json"},
                }],
            }}],
        });
        let completion: CompletionResponse = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            parse_reply(completion),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn parse_no_choices_is_malformed() {
        let raw = json!({"choices": []});
        let completion: CompletionResponse = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            parse_reply(completion),
            Err(ProviderError::MalformedResponse(_))
        ));
    }
}
