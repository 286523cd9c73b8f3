use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use parley_ai::{ModelDirectory, ProviderCache};
use parley_core::ids::ConversationId;
use parley_core::message::{MessageKind, Sender, ToolCall};
use parley_core::provider::{GenerateOptions, ProviderReply, ProviderTurn};
use parley_core::tools::{escalation_tool, ESCALATION_TOOL_NAME};
use parley_store::conversations::ConversationRow;
use parley_store::messages::{MessageRepo, MessageRow, NewMessage};
use parley_store::Database;

use crate::conversations::{ConversationService, EscalationSource};
use crate::error::ServiceError;

/// How many persisted prompt-relevant messages feed back into the provider.
const PROMPT_WINDOW: u32 = 10;
/// Upper bound on provider round-trips per user turn. The first round may
/// request tools; the second answers with tools withheld.
const MAX_TOOL_ROUNDS: u32 = 2;

const PROVIDER_FAILURE_TEXT: &str =
    "Sorry, I couldn't produce a response just now. Please try again in a moment.";

/// Everything one AI turn produced, in creation order, plus the updated
/// conversation when the turn escalated to a human agent.
pub struct AiTurnOutcome {
    pub messages: Vec<MessageRow>,
    pub escalation: Option<ConversationRow>,
}

/// Drives one assistant turn: rebuild history, call the provider, dispatch
/// tool calls, persist everything through the service.
pub struct AiOrchestrator {
    service: Arc<ConversationService>,
    messages: MessageRepo,
    directory: Arc<dyn ModelDirectory>,
    providers: Arc<ProviderCache>,
}

impl AiOrchestrator {
    pub fn new(
        db: Database,
        service: Arc<ConversationService>,
        directory: Arc<dyn ModelDirectory>,
        providers: Arc<ProviderCache>,
    ) -> Self {
        Self {
            service,
            messages: MessageRepo::new(db),
            directory,
            providers,
        }
    }

    /// Generate the assistant's reply to the latest user query in the
    /// conversation. The user query must already be persisted.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, model = model_id))]
    pub async fn generate_response(
        &self,
        conversation_id: &ConversationId,
        model_id: &str,
    ) -> Result<AiTurnOutcome, ServiceError> {
        let config = self
            .directory
            .model_config(model_id)
            .ok_or_else(|| ServiceError::NotFound(format!("model {model_id}")))?;
        let provider = self.providers.resolve(&config.provider)?;

        let mut outcome = AiTurnOutcome { messages: Vec::new(), escalation: None };

        let tools = if config.supports_tools {
            vec![escalation_tool()]
        } else {
            Vec::new()
        };

        let mut round = 1;
        loop {
            let turns = self.prompt_turns(conversation_id)?;
            let options = GenerateOptions {
                tools: if round == 1 { tools.clone() } else { Vec::new() },
                ..GenerateOptions::default()
            };

            let reply = match provider
                .generate(&turns, config.system_prompt.as_deref(), &config.api_identifier, &options)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(error = %err, kind = err.error_kind(), "provider call failed");
                    self.persist_failure_notice(conversation_id, model_id)?;
                    return Err(ServiceError::Upstream(err));
                }
            };

            let assistant = self.persist_assistant_reply(conversation_id, model_id, &reply)?;
            outcome.messages.push(assistant);

            if !reply.has_tool_calls() || round >= MAX_TOOL_ROUNDS {
                break;
            }

            for call in &reply.tool_calls {
                let (result, is_error) = self.dispatch_tool_call(conversation_id, call, &mut outcome);
                let mut tool_result = NewMessage::text(
                    conversation_id.clone(),
                    Sender::Tool,
                    MessageKind::ToolResult,
                    result,
                );
                tool_result.tool_call_id = Some(call.id.clone());
                tool_result.is_error = is_error;
                let (row, _) = self.service.create_message(tool_result)?;
                outcome.messages.push(row);
            }

            round += 1;
        }

        Ok(outcome)
    }

    /// Rebuild the provider prompt from the last window of persisted
    /// messages. Error-flagged rows are operational noise and stay out.
    fn prompt_turns(&self, conversation_id: &ConversationId) -> Result<Vec<ProviderTurn>, ServiceError> {
        let history = self.messages.recent_prompt_messages(conversation_id, PROMPT_WINDOW)?;
        let turns = history
            .iter()
            .filter(|row| !row.is_error)
            .filter_map(|row| match row.kind {
                MessageKind::UserQuery => {
                    row.content.clone().map(|content| ProviderTurn::User { content })
                }
                MessageKind::IaResponse => Some(ProviderTurn::Assistant {
                    content: row.content.clone(),
                    tool_calls: row.tool_calls.clone(),
                }),
                MessageKind::ToolResult => row.tool_call_id.clone().map(|tool_call_id| {
                    ProviderTurn::Tool {
                        tool_call_id,
                        content: row.content.clone().unwrap_or_default(),
                    }
                }),
                _ => None,
            })
            .collect();
        Ok(turns)
    }

    fn persist_assistant_reply(
        &self,
        conversation_id: &ConversationId,
        model_id: &str,
        reply: &ProviderReply,
    ) -> Result<MessageRow, ServiceError> {
        let message = NewMessage {
            conversation_id: conversation_id.clone(),
            sender: Sender::Ia,
            kind: MessageKind::IaResponse,
            content: reply.content.clone(),
            receiver_id: None,
            model_id: Some(model_id.to_string()),
            tool_call_id: None,
            tool_calls: reply.tool_calls.clone(),
            usage: reply.usage,
            is_error: false,
        };
        let (row, _) = self.service.create_message(message)?;
        Ok(row)
    }

    /// A failed provider call leaves a visible, error-flagged assistant
    /// message so the user sees the turn ended rather than hung.
    fn persist_failure_notice(
        &self,
        conversation_id: &ConversationId,
        model_id: &str,
    ) -> Result<(), ServiceError> {
        let mut notice = NewMessage::text(
            conversation_id.clone(),
            Sender::Ia,
            MessageKind::IaResponse,
            PROVIDER_FAILURE_TEXT,
        );
        notice.model_id = Some(model_id.to_string());
        notice.is_error = true;
        self.service.create_message(notice)?;
        Ok(())
    }

    /// Execute one requested tool call. Never fails the turn: unknown tools
    /// and tool failures degrade to an error-flagged result string.
    fn dispatch_tool_call(
        &self,
        conversation_id: &ConversationId,
        call: &ToolCall,
        outcome: &mut AiTurnOutcome,
    ) -> (String, bool) {
        if call.name != ESCALATION_TOOL_NAME {
            warn!(tool = %call.name, "assistant requested an unknown tool");
            return (
                json!({"error": format!("unknown tool: {}", call.name)}).to_string(),
                true,
            );
        }

        let reason = call
            .arguments
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("No reason provided");
        let urgency = call.arguments.get("urgency").and_then(Value::as_str);

        match self.service.escalate_to_agent(
            conversation_id,
            reason,
            urgency,
            EscalationSource::Tool,
        ) {
            Ok(conversation) => {
                info!(%conversation_id, reason, "assistant escalated to a human agent");
                let ack = json!({
                    "status": "escalated",
                    "reason": reason,
                })
                .to_string();
                outcome.escalation = Some(conversation);
                (ack, false)
            }
            Err(err) => {
                warn!(error = %err, "escalation tool call failed");
                (json!({"error": err.to_string()}).to_string(), true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_ai::{MockProvider, MockReply, ModelConfig, StaticModelDirectory};
    use parley_core::conversation::{ConversationStatus, Urgency};
    use parley_core::identity::{Identity, Role};
    use parley_core::ids::{ParticipantId, ToolCallId};

    struct Fixture {
        orchestrator: AiOrchestrator,
        service: Arc<ConversationService>,
        mock: Arc<MockProvider>,
        user: Identity,
    }

    fn fixture(replies: Vec<MockReply>, supports_tools: bool) -> Fixture {
        let db = Database::in_memory().unwrap();
        let service = Arc::new(ConversationService::new(db.clone()));

        let directory = Arc::new(StaticModelDirectory::new());
        directory.add_model(ModelConfig {
            model_id: "support-assistant".into(),
            provider: "mock".into(),
            api_identifier: "mock-model".into(),
            system_prompt: Some("You are a support assistant.".into()),
            supports_tools,
            allowed_roles: vec![Role::User],
            visible_to_client: true,
        });

        let mock = Arc::new(MockProvider::new(replies));
        let providers = Arc::new(ProviderCache::new(directory.clone()));
        providers.install("mock", mock.clone());

        Fixture {
            orchestrator: AiOrchestrator::new(db, service.clone(), directory, providers),
            service,
            mock,
            user: Identity::user(ParticipantId::from_raw("alice")),
        }
    }

    fn start_conversation(fix: &Fixture, text: &str) -> ConversationId {
        let (conv, _) = fix.service.find_or_create_ai(&fix.user, "support-assistant").unwrap();
        let query = NewMessage::text(
            conv.id.clone(),
            Sender::User { id: fix.user.id.clone() },
            MessageKind::UserQuery,
            text,
        );
        fix.service.create_message(query).unwrap();
        conv.id
    }

    fn escalation_call(id: &str, urgency: &str) -> ToolCall {
        ToolCall {
            id: ToolCallId::from_raw(id),
            name: ESCALATION_TOOL_NAME.into(),
            arguments: json!({"reason": "user asked for a human", "urgency": urgency}),
        }
    }

    #[tokio::test]
    async fn plain_reply_is_persisted() {
        let fix = fixture(vec![MockReply::text("Happy to help!")], true);
        let conv = start_conversation(&fix, "hello?");

        let outcome = fix
            .orchestrator
            .generate_response(&conv, "support-assistant")
            .await
            .unwrap();

        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].content.as_deref(), Some("Happy to help!"));
        assert_eq!(outcome.messages[0].kind, MessageKind::IaResponse);
        assert!(outcome.escalation.is_none());

        let calls = fix.mock.recorded_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tools_offered, 1);
        assert_eq!(calls[0].model, "mock-model");
        assert_eq!(calls[0].system_prompt.as_deref(), Some("You are a support assistant."));
        // The persisted user query fed the prompt.
        assert_eq!(calls[0].turns.len(), 1);
    }

    #[tokio::test]
    async fn tools_withheld_when_model_does_not_support_them() {
        let fix = fixture(vec![MockReply::text("ok")], false);
        let conv = start_conversation(&fix, "hi");

        fix.orchestrator.generate_response(&conv, "support-assistant").await.unwrap();
        assert_eq!(fix.mock.recorded_calls()[0].tools_offered, 0);
    }

    #[tokio::test]
    async fn escalation_tool_round_trip() {
        let fix = fixture(
            vec![
                MockReply::tool_call(escalation_call("call_1", "high")),
                MockReply::text("A human agent will be with you shortly."),
            ],
            true,
        );
        let conv = start_conversation(&fix, "I need a real person NOW");

        let outcome = fix
            .orchestrator
            .generate_response(&conv, "support-assistant")
            .await
            .unwrap();

        // Tool-request reply, the tool result, then the user-facing reply.
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(outcome.messages[0].tool_calls.len(), 1);
        assert_eq!(outcome.messages[1].kind, MessageKind::ToolResult);
        assert!(!outcome.messages[1].is_error);
        assert_eq!(
            outcome.messages[2].content.as_deref(),
            Some("A human agent will be with you shortly.")
        );

        let escalated = outcome.escalation.expect("turn should have escalated");
        assert_eq!(escalated.status, ConversationStatus::PendingAgent);
        let details = escalated.metadata.escalation_details.unwrap();
        assert_eq!(details.urgency, Urgency::High);
        assert!(details.escalated_by_tool);

        // Second round answered without tools attached.
        let calls = fix.mock.recorded_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tools_offered, 1);
        assert_eq!(calls[1].tools_offered, 0);
        // The second prompt saw the assistant tool call and its result.
        assert!(calls[1].turns.len() > calls[0].turns.len());
    }

    #[tokio::test]
    async fn unknown_tool_degrades_to_error_result() {
        let unknown = ToolCall {
            id: ToolCallId::from_raw("call_x"),
            name: "delete_all_data".into(),
            arguments: json!({}),
        };
        let fix = fixture(
            vec![MockReply::tool_call(unknown), MockReply::text("Let me try that differently.")],
            true,
        );
        let conv = start_conversation(&fix, "do something weird");

        let outcome = fix
            .orchestrator
            .generate_response(&conv, "support-assistant")
            .await
            .unwrap();

        assert_eq!(outcome.messages.len(), 3);
        assert!(outcome.messages[1].is_error);
        assert!(outcome.messages[1].content.as_ref().unwrap().contains("unknown tool"));
        assert!(outcome.escalation.is_none());
    }

    #[tokio::test]
    async fn provider_failure_leaves_visible_error_message() {
        let fix = fixture(
            vec![MockReply::Error(parley_core::errors::ProviderError::Overloaded)],
            true,
        );
        let conv = start_conversation(&fix, "hello?");

        let result = fix.orchestrator.generate_response(&conv, "support-assistant").await;
        assert!(matches!(result, Err(ServiceError::Upstream(_))));

        let messages = fix
            .service
            .messages_for_conversation(&fix.user, &conv, 10, None)
            .unwrap();
        assert!(messages[0].is_error);
        assert_eq!(messages[0].kind, MessageKind::IaResponse);
    }

    #[tokio::test]
    async fn error_messages_stay_out_of_the_prompt() {
        let fix = fixture(
            vec![
                MockReply::Error(parley_core::errors::ProviderError::Overloaded),
                MockReply::text("recovered"),
            ],
            true,
        );
        let conv = start_conversation(&fix, "hello?");

        let _ = fix.orchestrator.generate_response(&conv, "support-assistant").await;
        fix.orchestrator.generate_response(&conv, "support-assistant").await.unwrap();

        let calls = fix.mock.recorded_calls();
        // Second attempt's prompt holds only the user query, not the
        // error-flagged assistant message.
        assert_eq!(calls[1].turns.len(), 1);
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let fix = fixture(vec![], true);
        let conv = start_conversation(&fix, "hi");
        let result = fix.orchestrator.generate_response(&conv, "no-such-model").await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn tool_rounds_are_bounded() {
        // The model keeps asking for tools; the second round's calls are
        // persisted but never dispatched.
        let fix = fixture(
            vec![
                MockReply::tool_call(escalation_call("call_1", "low")),
                MockReply::tool_call(escalation_call("call_2", "low")),
            ],
            true,
        );
        let conv = start_conversation(&fix, "escalate forever");

        let outcome = fix
            .orchestrator
            .generate_response(&conv, "support-assistant")
            .await
            .unwrap();

        assert_eq!(fix.mock.call_count(), 2);
        // First round: assistant + tool result. Second round: assistant only.
        assert_eq!(outcome.messages.len(), 3);
        let tool_results = outcome
            .messages
            .iter()
            .filter(|m| m.kind == MessageKind::ToolResult)
            .count();
        assert_eq!(tool_results, 1);
    }
}
