use serde::Serialize;

use crate::conversation::{ConversationStatus, Urgency};
use crate::ids::{ConversationId, MessageId, ParticipantId};

/// Server→client event catalog. Serialized as
/// `{"event": "<camelCase name>", "payload": {...}}` on the wire.
///
/// Message and conversation payloads are carried as pre-serialized JSON so
/// the catalog stays independent of storage row types.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    // Direct user-to-user messaging
    MessageSent { message: serde_json::Value },
    NewMessage { message: serde_json::Value },
    MessageRead { message_id: MessageId, reader_id: ParticipantId },
    MessageReadAck { message_id: MessageId },
    UserTyping { conversation_id: Option<ConversationId>, sender_id: ParticipantId, is_typing: bool },

    // AI conversations
    #[serde(rename = "userMessageToIASent")]
    UserMessageToIaSent { message: serde_json::Value },
    #[serde(rename = "newMessageFromIA")]
    NewMessageFromIa { message: serde_json::Value },
    EscalationInProgress { conversation_id: ConversationId },

    // Escalation / agent workflows
    NewEscalatedChat { conversation: serde_json::Value },
    AgentMessageSent { message: serde_json::Value },
    ChatAssigned { conversation_id: ConversationId, agent_id: ParticipantId },
    ChatSuccessfullyPicked { conversation: serde_json::Value },
    ConversationMetadataUpdated { conversation_id: ConversationId, metadata: serde_json::Value },
    ConversationNoteAdded { conversation_id: ConversationId, note: serde_json::Value },
    ConversationPinned { conversation_id: ConversationId, author_id: ParticipantId },
    ConversationUnpinned { conversation_id: ConversationId, author_id: ParticipantId },
    ConversationClosed { conversation_id: ConversationId, status: ConversationStatus },
    ConversationStatusChanged { conversation_id: ConversationId, status: ConversationStatus },

    // Error boundary
    SocketError { code: String, message: String },
}

impl ServerEvent {
    pub fn socket_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SocketError { code: code.into(), message: message.into() }
    }

    /// Wire name of this event, as serialized in the `event` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageSent { .. } => "messageSent",
            Self::NewMessage { .. } => "newMessage",
            Self::MessageRead { .. } => "messageRead",
            Self::MessageReadAck { .. } => "messageReadAck",
            Self::UserTyping { .. } => "userTyping",
            Self::UserMessageToIaSent { .. } => "userMessageToIASent",
            Self::NewMessageFromIa { .. } => "newMessageFromIA",
            Self::EscalationInProgress { .. } => "escalationInProgress",
            Self::NewEscalatedChat { .. } => "newEscalatedChat",
            Self::AgentMessageSent { .. } => "agentMessageSent",
            Self::ChatAssigned { .. } => "chatAssigned",
            Self::ChatSuccessfullyPicked { .. } => "chatSuccessfullyPicked",
            Self::ConversationMetadataUpdated { .. } => "conversationMetadataUpdated",
            Self::ConversationNoteAdded { .. } => "conversationNoteAdded",
            Self::ConversationPinned { .. } => "conversationPinned",
            Self::ConversationUnpinned { .. } => "conversationUnpinned",
            Self::ConversationClosed { .. } => "conversationClosed",
            Self::ConversationStatusChanged { .. } => "conversationStatusChanged",
            Self::SocketError { .. } => "socketError",
        }
    }
}

/// Used only for the escalation broadcast payload, where urgency drives
/// client-side ordering.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationNotice {
    pub conversation_id: ConversationId,
    pub reason: String,
    pub urgency: Urgency,
}
