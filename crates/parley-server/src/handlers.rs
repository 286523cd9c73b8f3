//! Wire method handlers, dispatched by client→server method name.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use parley_ai::ModelDirectory;
use parley_core::conversation::Priority;
use parley_core::events::ServerEvent;
use parley_core::identity::{Identity, Role};
use parley_core::ids::{ConversationId, MessageId, ParticipantId};
use parley_core::message::{MessageKind, Sender};
use parley_service::{AiOrchestrator, ConversationService, ServiceError};
use parley_store::conversations::ConversationRow;
use parley_store::error::StoreError;
use parley_store::messages::NewMessage;

use crate::channels::{ChannelId, ChannelRegistry};
use crate::rpc::{self, WireResponse};

/// Shared state available to all method handlers.
pub struct HandlerState {
    pub service: Arc<ConversationService>,
    pub orchestrator: Arc<AiOrchestrator>,
    pub directory: Arc<dyn ModelDirectory>,
    pub registry: Arc<ChannelRegistry>,
}

/// Route one frame to its handler. Every handler runs inside the error
/// boundary: a `ServiceError` becomes a `socketError` event on the calling
/// channel plus an error ack, and the connection survives.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    channel_id: &ChannelId,
    identity: &Identity,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> WireResponse {
    let result = match method {
        // Direct user-to-user messaging
        "sendMessageToUser" => send_message_to_user(state, identity, params),
        "markMessageAsRead" => mark_message_read(state, identity, params),
        "typing" => typing(state, identity, params),
        "fetchConversations" => fetch_conversations(state, identity, params),
        "fetchMessages" => fetch_messages(state, identity, params),
        "markConversationAsRead" => mark_conversation_read(state, identity, params),
        "closeConversation" => close_conversation(state, identity, params),

        // AI conversations
        "sendMessageToIA" => send_message_to_ia(state, identity, params),
        "fetchAvailableModels" => fetch_available_models(state, identity),

        // Escalation / agent workflows
        "fetchEscalatedChats" => fetch_escalated_chats(state, identity),
        "agentPickChat" => agent_pick_chat(state, identity, params),
        "agentSendMessageToUser" => agent_send_message(state, identity, params),
        "agentUpdateConversationMetadata" => agent_update_metadata(state, identity, params),
        "agentAddNote" => agent_add_note(state, identity, params),
        "agentPinConversation" => agent_pin(state, identity, params, true),
        "agentUnpinConversation" => agent_pin(state, identity, params, false),
        "agentCloseConversation" => close_conversation(state, identity, params),

        _ => return WireResponse::method_not_found(id, method),
    };

    match result {
        Ok(value) => WireResponse::success(id, value),
        Err(ServiceError::Validation(msg)) if msg.starts_with("missing required parameter") => {
            WireResponse::invalid_params(id, msg)
        }
        Err(err) => {
            let event = ServerEvent::socket_error(err.code(), err.to_string());
            if let Ok(frame) = serde_json::to_string(&event) {
                state.registry.send_raw(channel_id, frame);
            }
            WireResponse::from_service_error(id, &err)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(value)
        .map_err(|e| ServiceError::Store(StoreError::Serialization(e.to_string())))
}

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ServiceError> {
    rpc::require_str(params, key).map_err(ServiceError::Validation)
}

// ── Direct messaging ──

fn send_message_to_user(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    if identity.role != Role::User {
        return Err(ServiceError::Forbidden(
            "staff use agentSendMessageToUser".into(),
        ));
    }
    let receiver = ParticipantId::from_raw(param_str(params, "receiverId")?);
    let content = param_str(params, "content")?;

    let (conversation, _) = state.service.find_or_create_direct(identity, &receiver)?;
    let mut message = NewMessage::text(
        conversation.id.clone(),
        Sender::User { id: identity.id.clone() },
        MessageKind::UserMessage,
        content,
    );
    message.receiver_id = Some(receiver.clone());
    let (message, conversation) = state.service.create_message(message)?;

    let message_json = to_json(&message)?;
    state.registry.emit_to_identity(
        &receiver,
        &ServerEvent::NewMessage { message: message_json.clone() },
    );
    state.registry.emit_to_identity(
        &identity.id,
        &ServerEvent::MessageSent { message: message_json.clone() },
    );

    Ok(json!({"message": message_json, "conversation": to_json(&conversation)?}))
}

fn mark_message_read(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let message_id = MessageId::from_raw(param_str(params, "messageId")?);
    let message = state.service.mark_message_read(identity, &message_id)?;

    if let Some(sender_id) = message.sender.participant_id() {
        state.registry.emit_to_identity(
            sender_id,
            &ServerEvent::MessageRead {
                message_id: message.id.clone(),
                reader_id: identity.id.clone(),
            },
        );
    }
    state.registry.emit_to_identity(
        &identity.id,
        &ServerEvent::MessageReadAck { message_id: message.id.clone() },
    );

    Ok(json!({"messageId": message.id}))
}

/// Typing relay is fire-and-forget: malformed params are ignored, not
/// errors, and nothing is persisted.
fn typing(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let receiver = rpc::optional_str(params, "receiverId");
    let is_typing = rpc::optional_bool(params, "isTyping");
    if let (Some(receiver), Some(is_typing)) = (receiver, is_typing) {
        let conversation_id = rpc::optional_str(params, "conversationId")
            .map(ConversationId::from_raw);
        state.registry.emit_to_identity(
            &ParticipantId::from_raw(receiver),
            &ServerEvent::UserTyping {
                conversation_id,
                sender_id: identity.id.clone(),
                is_typing,
            },
        );
    }
    Ok(json!({"ok": true}))
}

fn fetch_conversations(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let limit = rpc::optional_u32(params, "limit").unwrap_or(50);
    let offset = rpc::optional_u32(params, "offset").unwrap_or(0);
    let conversations = state.service.conversations_for_identity(identity, limit, offset)?;
    Ok(json!({"conversations": to_json(&conversations)?}))
}

fn fetch_messages(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let conversation_id = ConversationId::from_raw(param_str(params, "conversationId")?);
    let limit = rpc::optional_u32(params, "limit").unwrap_or(50);
    let before = rpc::optional_str(params, "before");
    let messages = state
        .service
        .messages_for_conversation(identity, &conversation_id, limit, before)?;
    Ok(json!({"messages": to_json(&messages)?}))
}

fn mark_conversation_read(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let conversation_id = ConversationId::from_raw(param_str(params, "conversationId")?);
    let conversation = state.service.mark_conversation_read(identity, &conversation_id)?;
    Ok(json!({"conversation": to_json(&conversation)?}))
}

fn close_conversation(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let conversation_id = ConversationId::from_raw(param_str(params, "conversationId")?);
    let conversation = state.service.close(identity, &conversation_id)?;

    let event = ServerEvent::ConversationClosed {
        conversation_id: conversation.id.clone(),
        status: conversation.status,
    };
    notify_participants(state, &conversation, Some(&identity.id), &event);
    state.registry.emit_to_staff(&event);

    Ok(json!({"conversation": to_json(&conversation)?}))
}

// ── AI conversations ──

fn send_message_to_ia(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let model_id = param_str(params, "modelId")?;
    let content = param_str(params, "content")?;

    let config = state
        .directory
        .model_config(model_id)
        .ok_or_else(|| ServiceError::NotFound(format!("model {model_id}")))?;
    if !config.is_available_to(identity.role) {
        return Err(ServiceError::Forbidden(format!(
            "model {model_id} is not available to {}",
            identity.role
        )));
    }

    let (conversation, _) = state.service.find_or_create_ai(identity, model_id)?;
    let mut query = NewMessage::text(
        conversation.id.clone(),
        Sender::User { id: identity.id.clone() },
        MessageKind::UserQuery,
        content,
    );
    query.model_id = Some(model_id.to_string());
    let (message, conversation) = state.service.create_message(query)?;

    let message_json = to_json(&message)?;
    state.registry.emit_to_identity(
        &identity.id,
        &ServerEvent::UserMessageToIaSent { message: message_json.clone() },
    );

    // The provider round-trip runs detached so one slow model never stalls
    // the frame loop. Results arrive as events.
    let task_state = Arc::clone(state);
    let user = identity.clone();
    let conversation_id = conversation.id.clone();
    let model = model_id.to_string();
    tokio::spawn(async move {
        run_ai_turn(&task_state, &user, &conversation_id, &model).await;
    });

    Ok(json!({"message": message_json, "conversation": to_json(&conversation)?}))
}

/// Drive the assistant turn and translate its outcome into events.
pub(crate) async fn run_ai_turn(
    state: &Arc<HandlerState>,
    user: &Identity,
    conversation_id: &ConversationId,
    model_id: &str,
) {
    match state.orchestrator.generate_response(conversation_id, model_id).await {
        Ok(outcome) => {
            for message in &outcome.messages {
                if message.kind != MessageKind::IaResponse {
                    continue;
                }
                match serde_json::to_value(message) {
                    Ok(message) => {
                        state
                            .registry
                            .emit_to_identity(&user.id, &ServerEvent::NewMessageFromIa { message });
                    }
                    Err(error) => warn!(%error, "failed to serialize assistant message"),
                }
            }
            if let Some(conversation) = outcome.escalation {
                emit_escalation(state, &user.id, &conversation);
            }
        }
        Err(err) => {
            warn!(error = %err, %conversation_id, "assistant turn failed");
            state.registry.emit_to_identity(
                &user.id,
                &ServerEvent::socket_error(err.code(), err.to_string()),
            );
        }
    }
}

fn emit_escalation(state: &Arc<HandlerState>, user: &ParticipantId, conversation: &ConversationRow) {
    state.registry.emit_to_identity(
        user,
        &ServerEvent::EscalationInProgress { conversation_id: conversation.id.clone() },
    );
    match serde_json::to_value(conversation) {
        Ok(conversation) => {
            state
                .registry
                .emit_to_staff(&ServerEvent::NewEscalatedChat { conversation });
        }
        Err(error) => warn!(%error, "failed to serialize escalated conversation"),
    }
}

fn fetch_available_models(
    state: &Arc<HandlerState>,
    identity: &Identity,
) -> Result<Value, ServiceError> {
    let models: Vec<Value> = state
        .directory
        .list_models()
        .into_iter()
        .filter(|m| m.is_available_to(identity.role))
        .map(|m| {
            json!({
                "modelId": m.model_id,
                "provider": m.provider,
                "supportsTools": m.supports_tools,
            })
        })
        .collect();
    Ok(json!({"models": models}))
}

// ── Agent workflows ──

fn fetch_escalated_chats(
    state: &Arc<HandlerState>,
    identity: &Identity,
) -> Result<Value, ServiceError> {
    let conversations = state.service.escalated_conversations(identity)?;
    Ok(json!({"conversations": to_json(&conversations)?}))
}

fn agent_pick_chat(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let conversation_id = ConversationId::from_raw(param_str(params, "conversationId")?);
    // Self-assignment unless an admin names another agent.
    let agent_id = rpc::optional_str(params, "agentId")
        .map(ParticipantId::from_raw)
        .unwrap_or_else(|| identity.id.clone());
    let conversation = state.service.assign_agent(identity, &conversation_id, &agent_id)?;
    let conversation_json = to_json(&conversation)?;

    notify_participants(
        state,
        &conversation,
        Some(&agent_id),
        &ServerEvent::ChatAssigned {
            conversation_id: conversation.id.clone(),
            agent_id: agent_id.clone(),
        },
    );
    state.registry.emit_to_identity(
        &agent_id,
        &ServerEvent::ChatSuccessfullyPicked { conversation: conversation_json.clone() },
    );
    // Other agents see the queue shrink.
    state.registry.emit_to_staff(&ServerEvent::ConversationStatusChanged {
        conversation_id: conversation.id.clone(),
        status: conversation.status,
    });

    Ok(json!({"conversation": conversation_json}))
}

fn agent_send_message(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let conversation_id = ConversationId::from_raw(param_str(params, "conversationId")?);
    let content = param_str(params, "content")?;

    let conversation = state.service.get_conversation(identity, &conversation_id)?;
    if conversation.agent_id.as_ref() != Some(&identity.id) && identity.role != Role::Admin {
        return Err(ServiceError::Forbidden(format!(
            "{} is not assigned to conversation {conversation_id}",
            identity.id
        )));
    }

    let message = NewMessage::text(
        conversation_id,
        Sender::Agent { id: identity.id.clone() },
        MessageKind::AgentMessage,
        content,
    );
    let (message, conversation) = state.service.create_message(message)?;

    let message_json = to_json(&message)?;
    notify_participants(
        state,
        &conversation,
        Some(&identity.id),
        &ServerEvent::AgentMessageSent { message: message_json.clone() },
    );

    Ok(json!({"message": message_json}))
}

fn agent_update_metadata(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let conversation_id = ConversationId::from_raw(param_str(params, "conversationId")?);
    let title = rpc::optional_str(params, "title").map(str::to_string);
    let tags = params.get("tags").map(|raw| {
        serde_json::from_value::<Vec<String>>(raw.clone())
            .map_err(|_| ServiceError::Validation("tags must be an array of strings".into()))
    });
    let tags = tags.transpose()?;
    let priority = params
        .get("priority")
        .map(|raw| {
            serde_json::from_value::<Priority>(raw.clone())
                .map_err(|_| ServiceError::Validation("unknown priority".into()))
        })
        .transpose()?;

    let conversation = state
        .service
        .update_metadata(identity, &conversation_id, title, tags, priority)?;

    state.registry.emit_to_staff(&ServerEvent::ConversationMetadataUpdated {
        conversation_id: conversation.id.clone(),
        metadata: to_json(&conversation.metadata)?,
    });

    Ok(json!({"conversation": to_json(&conversation)?}))
}

fn agent_add_note(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
) -> Result<Value, ServiceError> {
    let conversation_id = ConversationId::from_raw(param_str(params, "conversationId")?);
    let text = param_str(params, "text")?;
    let conversation = state.service.add_note(identity, &conversation_id, text)?;

    if let Some(note) = conversation.metadata.notes.last() {
        state.registry.emit_to_staff(&ServerEvent::ConversationNoteAdded {
            conversation_id: conversation.id.clone(),
            note: to_json(note)?,
        });
    }

    Ok(json!({"conversation": to_json(&conversation)?}))
}

fn agent_pin(
    state: &Arc<HandlerState>,
    identity: &Identity,
    params: &Value,
    pin: bool,
) -> Result<Value, ServiceError> {
    let conversation_id = ConversationId::from_raw(param_str(params, "conversationId")?);
    let conversation = if pin {
        state.service.pin(identity, &conversation_id)?
    } else {
        state.service.unpin(identity, &conversation_id)?
    };

    let event = if pin {
        ServerEvent::ConversationPinned {
            conversation_id: conversation.id.clone(),
            author_id: identity.id.clone(),
        }
    } else {
        ServerEvent::ConversationUnpinned {
            conversation_id: conversation.id.clone(),
            author_id: identity.id.clone(),
        }
    };
    state.registry.emit_to_staff(&event);

    Ok(json!({"conversation": to_json(&conversation)?}))
}

/// Deliver an event to every participant except `skip`.
fn notify_participants(
    state: &Arc<HandlerState>,
    conversation: &ConversationRow,
    skip: Option<&ParticipantId>,
    event: &ServerEvent,
) {
    for participant in &conversation.participants {
        if Some(participant) == skip {
            continue;
        }
        state.registry.emit_to_identity(participant, event);
    }
}
