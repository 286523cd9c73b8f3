use chrono::Utc;
use tracing::{info, instrument};

use parley_core::conversation::{
    ConversationKind, ConversationStatus, EscalationDetails, Note, PinMark, Priority, Urgency,
};
use parley_core::identity::{Identity, Role};
use parley_core::ids::{ConversationId, MessageId, ParticipantId};
use parley_core::message::{MessageKind, Sender};
use parley_store::conversations::{ai_pair_key, direct_pair_key, ConversationRepo, ConversationRow};
use parley_store::messages::{MessageRepo, MessageRow, NewMessage};
use parley_store::Database;

use crate::error::ServiceError;

/// Who asked for an escalation. The tool path carries no identity and
/// bypasses the access gate; it can only be reached from inside an AI turn
/// on the conversation itself.
pub enum EscalationSource<'a> {
    Tool,
    Participant(&'a Identity),
}

/// Business rules over conversations and messages. Transport-agnostic:
/// WebSocket handlers and the AI orchestrator both sit on top of this.
pub struct ConversationService {
    conversations: ConversationRepo,
    messages: MessageRepo,
}

impl ConversationService {
    pub fn new(db: Database) -> Self {
        Self {
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }

    // ---- creation ----------------------------------------------------

    /// Find or create the direct conversation between a user and another
    /// participant. Idempotent: both directions land on the same row.
    #[instrument(skip(self, identity), fields(participant = %identity.id, other = %other))]
    pub fn find_or_create_direct(
        &self,
        identity: &Identity,
        other: &ParticipantId,
    ) -> Result<(ConversationRow, bool), ServiceError> {
        if identity.id == *other {
            return Err(ServiceError::Validation(
                "cannot open a conversation with yourself".into(),
            ));
        }
        let key = direct_pair_key(&identity.id, other);
        let row = self.conversations.find_or_create(
            &key,
            ConversationKind::UserToUser,
            &[identity.id.clone(), other.clone()],
            None,
        )?;
        Ok(row)
    }

    /// Find or create the AI conversation between a user and a model. One
    /// thread per user+model pair.
    #[instrument(skip(self, identity), fields(participant = %identity.id, model = model_id))]
    pub fn find_or_create_ai(
        &self,
        identity: &Identity,
        model_id: &str,
    ) -> Result<(ConversationRow, bool), ServiceError> {
        if model_id.trim().is_empty() {
            return Err(ServiceError::Validation("model_id must not be empty".into()));
        }
        let key = ai_pair_key(&identity.id, model_id);
        let row = self.conversations.find_or_create(
            &key,
            ConversationKind::UserToIa,
            std::slice::from_ref(&identity.id),
            Some(model_id),
        )?;
        Ok(row)
    }

    // ---- messages -----------------------------------------------------

    /// Persist a message and update the conversation's unread counts and
    /// last-message pointer. Human senders must be participants; closed
    /// conversations reject everything.
    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id, kind = %message.kind))]
    pub fn create_message(
        &self,
        message: NewMessage,
    ) -> Result<(MessageRow, ConversationRow), ServiceError> {
        let conversation = self.conversations.get(&message.conversation_id)?;

        if conversation.status.is_closed() {
            return Err(ServiceError::Conflict(format!(
                "conversation {} is closed",
                conversation.id
            )));
        }

        if let Some(sender_id) = message.sender.participant_id() {
            if !conversation.is_participant(sender_id) {
                return Err(ServiceError::Forbidden(format!(
                    "{sender_id} is not a participant of {}",
                    conversation.id
                )));
            }
        }

        validate_kind_sender(&message)?;

        let content_missing = message
            .content
            .as_deref()
            .map_or(true, |c| c.trim().is_empty());
        let tool_only_reply = message.kind == MessageKind::IaResponse && !message.tool_calls.is_empty();
        if content_missing && !tool_only_reply {
            return Err(ServiceError::Validation("message content must not be empty".into()));
        }

        if message.kind == MessageKind::ToolResult {
            let call_id = message.tool_call_id.as_ref().ok_or_else(|| {
                ServiceError::Validation("tool_result requires tool_call_id".into())
            })?;
            if !self
                .messages
                .assistant_tool_call_exists(&message.conversation_id, call_id)?
            {
                return Err(ServiceError::Validation(format!(
                    "tool_call_id {call_id} does not match any assistant tool call"
                )));
            }
        }

        if let Some(receiver) = &message.receiver_id {
            if !conversation.is_participant(receiver) {
                return Err(ServiceError::Validation(format!(
                    "receiver {receiver} is not a participant"
                )));
            }
        }

        let sender_id = message.sender.participant_id().cloned();
        let row = self.messages.insert(message)?;
        let conversation =
            self.conversations
                .bump_unread(&row.conversation_id, sender_id.as_ref(), &row.id)?;
        Ok((row, conversation))
    }

    #[instrument(skip(self, identity), fields(participant = %identity.id, message_id = %message_id))]
    pub fn mark_message_read(
        &self,
        identity: &Identity,
        message_id: &MessageId,
    ) -> Result<MessageRow, ServiceError> {
        let message = self.messages.get(message_id)?;
        let conversation = self.conversations.get(&message.conversation_id)?;
        self.validate_access(identity, &conversation)?;
        Ok(self.messages.mark_read(message_id, &identity.id)?)
    }

    /// Reset the caller's unread counter to zero.
    #[instrument(skip(self, identity), fields(participant = %identity.id, conversation_id = %conversation_id))]
    pub fn mark_conversation_read(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
    ) -> Result<ConversationRow, ServiceError> {
        let conversation = self.conversations.get(conversation_id)?;
        self.validate_access(identity, &conversation)?;
        if conversation.status.is_closed() {
            return Err(ServiceError::Conflict(format!(
                "conversation {conversation_id} is closed"
            )));
        }
        Ok(self.conversations.reset_unread(conversation_id, &identity.id)?)
    }

    // ---- reads --------------------------------------------------------

    pub fn get_conversation(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
    ) -> Result<ConversationRow, ServiceError> {
        let conversation = self.conversations.get(conversation_id)?;
        self.validate_access(identity, &conversation)?;
        Ok(conversation)
    }

    #[instrument(skip(self, identity), fields(participant = %identity.id))]
    pub fn conversations_for_identity(
        &self,
        identity: &Identity,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationRow>, ServiceError> {
        Ok(self
            .conversations
            .list_for_participant(&identity.id, limit, offset)?)
    }

    #[instrument(skip(self, identity), fields(participant = %identity.id, conversation_id = %conversation_id))]
    pub fn messages_for_conversation(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>, ServiceError> {
        let conversation = self.conversations.get(conversation_id)?;
        self.validate_access(identity, &conversation)?;
        Ok(self.messages.list(conversation_id, limit, before)?)
    }

    /// The escalation queue: pending conversations, highest urgency first,
    /// most recently active breaking ties. Staff only.
    #[instrument(skip(self, identity), fields(participant = %identity.id))]
    pub fn escalated_conversations(
        &self,
        identity: &Identity,
    ) -> Result<Vec<ConversationRow>, ServiceError> {
        self.require_staff(identity)?;
        let mut pending = self.conversations.list_pending_agent()?;
        pending.sort_by(|a, b| {
            let ua = escalation_urgency(a).weight();
            let ub = escalation_urgency(b).weight();
            ub.cmp(&ua).then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        Ok(pending)
    }

    // ---- escalation and assignment ------------------------------------

    /// Move a conversation into the agent queue. Urgency is normalized,
    /// never rejected. Already-pending conversations just refresh the
    /// escalation details.
    #[instrument(skip(self, source), fields(conversation_id = %conversation_id))]
    pub fn escalate_to_agent(
        &self,
        conversation_id: &ConversationId,
        reason: &str,
        urgency: Option<&str>,
        source: EscalationSource<'_>,
    ) -> Result<ConversationRow, ServiceError> {
        let conversation = self.conversations.get(conversation_id)?;

        let escalated_by_tool = match source {
            EscalationSource::Tool => true,
            EscalationSource::Participant(identity) => {
                // Manual escalation is a staff action; end-users get there
                // through the assistant's tool call.
                self.require_staff(identity)?;
                self.validate_access(identity, &conversation)?;
                false
            }
        };

        let already_pending = conversation.status == ConversationStatus::PendingAgent;
        if !already_pending
            && !conversation
                .status
                .can_transition_to(ConversationStatus::PendingAgent)
        {
            return Err(ServiceError::Conflict(format!(
                "conversation {conversation_id} cannot be escalated from {}",
                conversation.status
            )));
        }

        let details = EscalationDetails {
            reason: reason.to_string(),
            urgency: Urgency::normalize(urgency),
            escalated_by_tool,
            timestamp: Utc::now(),
        };
        let urgency = details.urgency;
        self.conversations
            .with_metadata(conversation_id, |meta| meta.escalation_details = Some(details))?;

        if already_pending {
            return Ok(self.conversations.get(conversation_id)?);
        }

        self.conversations
            .update_status(conversation_id, ConversationStatus::PendingAgent)?;
        info!(%conversation_id, ?urgency, escalated_by_tool, "conversation escalated");
        self.append_system_notification(
            conversation_id,
            "This conversation has been escalated to a human agent.",
        )
    }

    /// Atomically hand a pending conversation to an agent. Staff only; the
    /// conversation must currently be waiting. Agents assign themselves;
    /// assigning someone else takes an admin.
    #[instrument(skip(self, identity), fields(requester = %identity.id, agent = %agent_id, conversation_id = %conversation_id))]
    pub fn assign_agent(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
        agent_id: &ParticipantId,
    ) -> Result<ConversationRow, ServiceError> {
        self.require_staff(identity)?;
        if agent_id != &identity.id && identity.role != Role::Admin {
            return Err(ServiceError::Forbidden(format!(
                "{} may only assign themselves",
                identity.id
            )));
        }
        let conversation = self.conversations.get(conversation_id)?;
        if !conversation
            .status
            .can_transition_to(ConversationStatus::AgentActive)
        {
            return Err(ServiceError::Conflict(format!(
                "conversation {conversation_id} is not waiting for an agent (status {})",
                conversation.status
            )));
        }

        self.conversations.assign_agent(conversation_id, agent_id)?;
        info!(%conversation_id, agent = %agent_id, "conversation assigned");
        self.append_system_notification(conversation_id, "A support agent has joined the conversation.")
    }

    /// Close terminally. Users produce `closed_by_user`, staff
    /// `closed_by_agent`. The closing notification is appended first,
    /// while the conversation still accepts messages.
    #[instrument(skip(self, identity), fields(participant = %identity.id, conversation_id = %conversation_id))]
    pub fn close(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
    ) -> Result<ConversationRow, ServiceError> {
        let conversation = self.conversations.get(conversation_id)?;
        self.validate_access(identity, &conversation)?;

        let target = match identity.role {
            Role::User => ConversationStatus::ClosedByUser,
            Role::Agent | Role::Admin => ConversationStatus::ClosedByAgent,
        };
        if !conversation.status.can_transition_to(target) {
            return Err(ServiceError::Conflict(format!(
                "conversation {conversation_id} is already closed"
            )));
        }

        self.append_system_notification(conversation_id, "This conversation has been closed.")?;
        self.conversations.update_status(conversation_id, target)?;
        info!(%conversation_id, status = %target, "conversation closed");
        Ok(self.conversations.get(conversation_id)?)
    }

    /// Soft removal from active lists. Admin only; conversations are never
    /// hard-deleted.
    #[instrument(skip(self, identity), fields(participant = %identity.id, conversation_id = %conversation_id))]
    pub fn archive(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
    ) -> Result<ConversationRow, ServiceError> {
        if identity.role != Role::Admin {
            return Err(ServiceError::Forbidden("only admins may archive".into()));
        }
        let conversation = self.conversations.get(conversation_id)?;
        if !conversation
            .status
            .can_transition_to(ConversationStatus::Archived)
        {
            return Err(ServiceError::Conflict(format!(
                "conversation {conversation_id} cannot be archived from {}",
                conversation.status
            )));
        }
        self.conversations
            .update_status(conversation_id, ConversationStatus::Archived)?;
        Ok(self.conversations.get(conversation_id)?)
    }

    // ---- metadata (staff surfaces) ------------------------------------

    #[instrument(skip(self, identity, title, tags), fields(participant = %identity.id, conversation_id = %conversation_id))]
    pub fn update_metadata(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
        title: Option<String>,
        tags: Option<Vec<String>>,
        priority: Option<Priority>,
    ) -> Result<ConversationRow, ServiceError> {
        self.staff_metadata_gate(identity, conversation_id)?;
        Ok(self.conversations.with_metadata(conversation_id, |meta| {
            if let Some(title) = title {
                meta.title = Some(title);
            }
            if let Some(tags) = tags {
                meta.set_tags(tags);
            }
            if let Some(priority) = priority {
                meta.priority = priority;
            }
        })?)
    }

    #[instrument(skip(self, identity, text), fields(participant = %identity.id, conversation_id = %conversation_id))]
    pub fn add_note(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<ConversationRow, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::Validation("note text must not be empty".into()));
        }
        self.staff_metadata_gate(identity, conversation_id)?;
        let note = Note {
            author_id: identity.id.clone(),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        Ok(self
            .conversations
            .with_metadata(conversation_id, |meta| meta.notes.push(note))?)
    }

    /// Pin for the calling staff member. Idempotent.
    #[instrument(skip(self, identity), fields(participant = %identity.id, conversation_id = %conversation_id))]
    pub fn pin(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
    ) -> Result<ConversationRow, ServiceError> {
        self.staff_metadata_gate(identity, conversation_id)?;
        let author = identity.id.clone();
        Ok(self.conversations.with_metadata(conversation_id, |meta| {
            if !meta.is_pinned_by(&author) {
                meta.pinned_by.push(PinMark { author_id: author, pinned_at: Utc::now() });
            }
        })?)
    }

    #[instrument(skip(self, identity), fields(participant = %identity.id, conversation_id = %conversation_id))]
    pub fn unpin(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
    ) -> Result<ConversationRow, ServiceError> {
        self.staff_metadata_gate(identity, conversation_id)?;
        let author = identity.id.clone();
        Ok(self.conversations.with_metadata(conversation_id, |meta| {
            meta.pinned_by.retain(|p| p.author_id != author);
        })?)
    }

    // ---- gates --------------------------------------------------------

    /// The access gate. Users must be participants. Agents pass when they
    /// participate, are assigned, or the conversation is waiting in the
    /// escalation queue. Admins always pass.
    pub fn validate_access(
        &self,
        identity: &Identity,
        conversation: &ConversationRow,
    ) -> Result<(), ServiceError> {
        let allowed = match identity.role {
            Role::Admin => true,
            Role::User => conversation.is_participant(&identity.id),
            Role::Agent => {
                conversation.is_participant(&identity.id)
                    || conversation.agent_id.as_ref() == Some(&identity.id)
                    || conversation.status == ConversationStatus::PendingAgent
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "{} may not access conversation {}",
                identity.id, conversation.id
            )))
        }
    }

    fn require_staff(&self, identity: &Identity) -> Result<(), ServiceError> {
        if identity.role.is_staff() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "{} is not an agent or admin",
                identity.id
            )))
        }
    }

    fn staff_metadata_gate(
        &self,
        identity: &Identity,
        conversation_id: &ConversationId,
    ) -> Result<(), ServiceError> {
        self.require_staff(identity)?;
        let conversation = self.conversations.get(conversation_id)?;
        self.validate_access(identity, &conversation)?;
        if conversation.status.is_closed() {
            return Err(ServiceError::Conflict(format!(
                "conversation {conversation_id} is closed"
            )));
        }
        Ok(())
    }

    fn append_system_notification(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<ConversationRow, ServiceError> {
        let row = self.messages.insert(NewMessage::text(
            conversation_id.clone(),
            Sender::System,
            MessageKind::SystemNotification,
            text,
        ))?;
        Ok(self.conversations.bump_unread(conversation_id, None, &row.id)?)
    }
}

fn escalation_urgency(conversation: &ConversationRow) -> Urgency {
    conversation
        .metadata
        .escalation_details
        .as_ref()
        .map(|d| d.urgency)
        .unwrap_or_default()
}

fn validate_kind_sender(message: &NewMessage) -> Result<(), ServiceError> {
    let ok = matches!(
        (&message.sender, message.kind),
        (Sender::User { .. }, MessageKind::UserQuery | MessageKind::UserMessage)
            | (Sender::Agent { .. }, MessageKind::AgentMessage)
            | (Sender::Ia, MessageKind::IaResponse)
            | (Sender::Tool, MessageKind::ToolResult)
            | (Sender::System, MessageKind::SystemNotification)
    );
    if ok {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "sender cannot produce a {} message",
            message.kind
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::message::ToolCall;
    use parley_core::ids::ToolCallId;

    fn service() -> ConversationService {
        ConversationService::new(Database::in_memory().unwrap())
    }

    fn user(id: &str) -> Identity {
        Identity::user(ParticipantId::from_raw(id))
    }

    fn agent(id: &str) -> Identity {
        Identity::agent(ParticipantId::from_raw(id))
    }

    fn user_message(conversation: &ConversationRow, identity: &Identity, text: &str) -> NewMessage {
        NewMessage::text(
            conversation.id.clone(),
            Sender::User { id: identity.id.clone() },
            MessageKind::UserMessage,
            text,
        )
    }

    #[test]
    fn direct_creation_is_idempotent_both_directions() {
        let svc = service();
        let alice = user("alice");
        let bob = user("bob");

        let (first, created) = svc.find_or_create_direct(&alice, &bob.id).unwrap();
        assert!(created);
        let (second, created_again) = svc.find_or_create_direct(&bob, &alice.id).unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn self_conversation_rejected() {
        let svc = service();
        let alice = user("alice");
        assert!(matches!(
            svc.find_or_create_direct(&alice, &alice.id),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn message_updates_unread_and_last_message() {
        let svc = service();
        let alice = user("alice");
        let bob = user("bob");
        let (conv, _) = svc.find_or_create_direct(&alice, &bob.id).unwrap();

        let (msg, conv) = svc.create_message(user_message(&conv, &alice, "hi bob")).unwrap();
        assert_eq!(conv.unread_for(&bob.id), 1);
        assert_eq!(conv.unread_for(&alice.id), 0);
        assert_eq!(conv.last_message_id.as_ref(), Some(&msg.id));

        let conv = svc.mark_conversation_read(&bob, &conv.id).unwrap();
        assert_eq!(conv.unread_for(&bob.id), 0);
    }

    #[test]
    fn non_participant_cannot_send() {
        let svc = service();
        let alice = user("alice");
        let bob = user("bob");
        let mallory = user("mallory");
        let (conv, _) = svc.find_or_create_direct(&alice, &bob.id).unwrap();

        let result = svc.create_message(user_message(&conv, &mallory, "let me in"));
        assert!(matches!(result, Err(ServiceError::Forbidden(_))));
    }

    #[test]
    fn closed_conversation_rejects_messages_and_metadata() {
        let svc = service();
        let alice = user("alice");
        let bob = user("bob");
        let (conv, _) = svc.find_or_create_direct(&alice, &bob.id).unwrap();

        let closed = svc.close(&alice, &conv.id).unwrap();
        assert_eq!(closed.status, ConversationStatus::ClosedByUser);

        assert!(matches!(
            svc.create_message(user_message(&conv, &alice, "one more thing")),
            Err(ServiceError::Conflict(_))
        ));
        let admin = Identity::admin(ParticipantId::from_raw("root"));
        assert!(matches!(
            svc.update_metadata(&admin, &conv.id, Some("t".into()), None, None),
            Err(ServiceError::Conflict(_))
        ));
        // Closing twice is a conflict, not a state change.
        assert!(matches!(svc.close(&alice, &conv.id), Err(ServiceError::Conflict(_))));
    }

    #[test]
    fn close_appends_system_notification() {
        let svc = service();
        let alice = user("alice");
        let bob = user("bob");
        let (conv, _) = svc.find_or_create_direct(&alice, &bob.id).unwrap();
        svc.close(&alice, &conv.id).unwrap();

        let messages = svc.messages_for_conversation(&alice, &conv.id, 10, None).unwrap();
        assert_eq!(messages[0].kind, MessageKind::SystemNotification);
    }

    #[test]
    fn empty_content_rejected_unless_tool_only_reply() {
        let svc = service();
        let alice = user("alice");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();

        let mut empty = user_message(&conv, &alice, "  ");
        empty.kind = MessageKind::UserQuery;
        assert!(matches!(
            svc.create_message(empty),
            Err(ServiceError::Validation(_))
        ));

        let mut tool_reply = NewMessage::text(
            conv.id.clone(),
            Sender::Ia,
            MessageKind::IaResponse,
            "",
        );
        tool_reply.content = None;
        tool_reply.tool_calls = vec![ToolCall {
            id: ToolCallId::from_raw("call_1"),
            name: "escalate_to_human_agent".into(),
            arguments: serde_json::json!({"reason": "x"}),
        }];
        assert!(svc.create_message(tool_reply).is_ok());
    }

    #[test]
    fn tool_result_requires_matching_assistant_call() {
        let svc = service();
        let alice = user("alice");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();

        let mut orphan = NewMessage::text(
            conv.id.clone(),
            Sender::Tool,
            MessageKind::ToolResult,
            "{\"status\":\"escalated\"}",
        );
        orphan.tool_call_id = Some(ToolCallId::from_raw("call_unknown"));
        assert!(matches!(
            svc.create_message(orphan),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn sender_kind_mismatch_rejected() {
        let svc = service();
        let alice = user("alice");
        let bob = user("bob");
        let (conv, _) = svc.find_or_create_direct(&alice, &bob.id).unwrap();

        // A user pretending to be the assistant.
        let forged = NewMessage::text(
            conv.id.clone(),
            Sender::User { id: alice.id.clone() },
            MessageKind::IaResponse,
            "I am the AI now",
        );
        assert!(matches!(
            svc.create_message(forged),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn escalation_normalizes_urgency_and_moves_status() {
        let svc = service();
        let alice = user("alice");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();

        let escalated = svc
            .escalate_to_agent(&conv.id, "user demanded a human", Some("CRITICAL!!"), EscalationSource::Tool)
            .unwrap();
        assert_eq!(escalated.status, ConversationStatus::PendingAgent);
        let details = escalated.metadata.escalation_details.as_ref().unwrap();
        assert_eq!(details.urgency, Urgency::Medium);
        assert!(details.escalated_by_tool);
    }

    #[test]
    fn escalating_pending_conversation_refreshes_details_only() {
        let svc = service();
        let alice = user("alice");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();

        svc.escalate_to_agent(&conv.id, "first", Some("low"), EscalationSource::Tool)
            .unwrap();
        let again = svc
            .escalate_to_agent(&conv.id, "second", Some("high"), EscalationSource::Tool)
            .unwrap();
        assert_eq!(again.status, ConversationStatus::PendingAgent);
        let details = again.metadata.escalation_details.as_ref().unwrap();
        assert_eq!(details.reason, "second");
        assert_eq!(details.urgency, Urgency::High);

        // Only one escalation notification was appended.
        let system_count = svc
            .messages_for_conversation(&alice, &conv.id, 50, None)
            .unwrap()
            .iter()
            .filter(|m| m.kind == MessageKind::SystemNotification)
            .count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn manual_escalation_is_staff_only() {
        let svc = service();
        let alice = user("alice");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();

        // A plain participant cannot put themselves in the agent queue.
        assert!(matches!(
            svc.escalate_to_agent(&conv.id, "I want a human", None, EscalationSource::Participant(&alice)),
            Err(ServiceError::Forbidden(_))
        ));
        assert_eq!(
            svc.get_conversation(&alice, &conv.id).unwrap().status,
            ConversationStatus::Active
        );

        // The tool path still works, and so does an admin.
        let root = Identity::admin(ParticipantId::from_raw("root"));
        let escalated = svc
            .escalate_to_agent(&conv.id, "flagged by staff", Some("high"), EscalationSource::Participant(&root))
            .unwrap();
        assert_eq!(escalated.status, ConversationStatus::PendingAgent);
        assert!(!escalated.metadata.escalation_details.unwrap().escalated_by_tool);
    }

    #[test]
    fn escalated_queue_orders_by_urgency_then_recency() {
        let svc = service();
        let low = svc.find_or_create_ai(&user("u1"), "m").unwrap().0;
        let high = svc.find_or_create_ai(&user("u2"), "m").unwrap().0;
        let medium = svc.find_or_create_ai(&user("u3"), "m").unwrap().0;

        svc.escalate_to_agent(&low.id, "r", Some("low"), EscalationSource::Tool).unwrap();
        svc.escalate_to_agent(&high.id, "r", Some("high"), EscalationSource::Tool).unwrap();
        svc.escalate_to_agent(&medium.id, "r", None, EscalationSource::Tool).unwrap();

        let queue = svc.escalated_conversations(&agent("a1")).unwrap();
        let ids: Vec<_> = queue.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![high.id, medium.id, low.id]);
    }

    #[test]
    fn escalated_queue_is_staff_only() {
        let svc = service();
        assert!(matches!(
            svc.escalated_conversations(&user("alice")),
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[test]
    fn assignment_requires_pending_status() {
        let svc = service();
        let alice = user("alice");
        let handler = agent("agent-1");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();

        assert!(matches!(
            svc.assign_agent(&handler, &conv.id, &handler.id),
            Err(ServiceError::Conflict(_))
        ));

        svc.escalate_to_agent(&conv.id, "r", None, EscalationSource::Tool).unwrap();
        let assigned = svc.assign_agent(&handler, &conv.id, &handler.id).unwrap();
        assert_eq!(assigned.status, ConversationStatus::AgentActive);
        assert_eq!(assigned.kind, ConversationKind::UserToAgent);
        assert!(assigned.is_participant(&handler.id));
    }

    #[test]
    fn admins_assign_named_agents_agents_only_themselves() {
        let svc = service();
        let alice = user("alice");
        let handler = agent("agent-1");
        let other = agent("agent-2");
        let root = Identity::admin(ParticipantId::from_raw("root"));
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();
        svc.escalate_to_agent(&conv.id, "r", None, EscalationSource::Tool).unwrap();

        // An agent cannot hand the conversation to someone else.
        assert!(matches!(
            svc.assign_agent(&other, &conv.id, &handler.id),
            Err(ServiceError::Forbidden(_))
        ));

        // An admin can.
        let assigned = svc.assign_agent(&root, &conv.id, &handler.id).unwrap();
        assert_eq!(assigned.agent_id.as_ref(), Some(&handler.id));
        assert_eq!(assigned.status, ConversationStatus::AgentActive);
        assert!(assigned.is_participant(&handler.id));
    }

    #[test]
    fn mark_conversation_read_rejects_closed() {
        let svc = service();
        let alice = user("alice");
        let bob = user("bob");
        let (conv, _) = svc.find_or_create_direct(&alice, &bob.id).unwrap();
        svc.close(&alice, &conv.id).unwrap();

        assert!(matches!(
            svc.mark_conversation_read(&bob, &conv.id),
            Err(ServiceError::Conflict(_))
        ));
    }

    #[test]
    fn agent_access_covers_pending_and_assigned() {
        let svc = service();
        let alice = user("alice");
        let handler = agent("agent-1");
        let other_agent = agent("agent-2");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();

        // Not pending, not assigned: no access.
        assert!(svc.get_conversation(&handler, &conv.id).is_err());

        svc.escalate_to_agent(&conv.id, "r", None, EscalationSource::Tool).unwrap();
        assert!(svc.get_conversation(&handler, &conv.id).is_ok());

        svc.assign_agent(&handler, &conv.id, &handler.id).unwrap();
        assert!(svc.get_conversation(&handler, &conv.id).is_ok());
        assert!(svc.get_conversation(&other_agent, &conv.id).is_err());

        // Admin always passes.
        assert!(svc.get_conversation(&Identity::admin(ParticipantId::from_raw("root")), &conv.id).is_ok());
    }

    #[test]
    fn notes_and_pins_are_staff_surfaces() {
        let svc = service();
        let alice = user("alice");
        let handler = agent("agent-1");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();
        svc.escalate_to_agent(&conv.id, "r", None, EscalationSource::Tool).unwrap();
        svc.assign_agent(&handler, &conv.id, &handler.id).unwrap();

        assert!(matches!(
            svc.add_note(&alice, &conv.id, "user note"),
            Err(ServiceError::Forbidden(_))
        ));

        let noted = svc.add_note(&handler, &conv.id, "asked for refund twice").unwrap();
        assert_eq!(noted.metadata.notes.len(), 1);

        let pinned = svc.pin(&handler, &conv.id).unwrap();
        assert!(pinned.metadata.is_pinned_by(&handler.id));
        // Pin is idempotent.
        let pinned_again = svc.pin(&handler, &conv.id).unwrap();
        assert_eq!(pinned_again.metadata.pinned_by.len(), 1);

        let unpinned = svc.unpin(&handler, &conv.id).unwrap();
        assert!(!unpinned.metadata.is_pinned_by(&handler.id));
    }

    #[test]
    fn metadata_update_applies_fields() {
        let svc = service();
        let alice = user("alice");
        let handler = agent("agent-1");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();
        svc.escalate_to_agent(&conv.id, "r", None, EscalationSource::Tool).unwrap();
        svc.assign_agent(&handler, &conv.id, &handler.id).unwrap();

        let updated = svc
            .update_metadata(
                &handler,
                &conv.id,
                Some("Refund request".into()),
                Some(vec!["Billing".into(), "billing".into()]),
                Some(Priority::High),
            )
            .unwrap();
        assert_eq!(updated.metadata.title.as_deref(), Some("Refund request"));
        assert_eq!(updated.metadata.tags, vec!["billing"]);
        assert_eq!(updated.metadata.priority, Priority::High);
    }

    #[test]
    fn archive_is_admin_only() {
        let svc = service();
        let alice = user("alice");
        let (conv, _) = svc.find_or_create_ai(&alice, "support-assistant").unwrap();

        assert!(matches!(
            svc.archive(&agent("a1"), &conv.id),
            Err(ServiceError::Forbidden(_))
        ));
        let archived = svc
            .archive(&Identity::admin(ParticipantId::from_raw("root")), &conv.id)
            .unwrap();
        assert_eq!(archived.status, ConversationStatus::Archived);
    }

    #[test]
    fn mark_message_read_gated_by_access() {
        let svc = service();
        let alice = user("alice");
        let bob = user("bob");
        let mallory = user("mallory");
        let (conv, _) = svc.find_or_create_direct(&alice, &bob.id).unwrap();
        let (msg, _) = svc.create_message(user_message(&conv, &alice, "hi")).unwrap();

        assert!(matches!(
            svc.mark_message_read(&mallory, &msg.id),
            Err(ServiceError::Forbidden(_))
        ));
        let read = svc.mark_message_read(&bob, &msg.id).unwrap();
        assert!(read.is_read_by(&bob.id));
    }
}
