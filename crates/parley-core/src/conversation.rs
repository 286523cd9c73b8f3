use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ParticipantId;

/// What kind of parties a conversation connects. An AI conversation becomes
/// `UserToAgent` once a human agent is assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    UserToUser,
    UserToIa,
    UserToAgent,
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserToUser => write!(f, "user_to_user"),
            Self::UserToIa => write!(f, "user_to_ia"),
            Self::UserToAgent => write!(f, "user_to_agent"),
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_to_user" => Ok(Self::UserToUser),
            "user_to_ia" => Ok(Self::UserToIa),
            "user_to_agent" => Ok(Self::UserToAgent),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

/// Conversation lifecycle. Closed states are terminal: no transition is
/// defined out of them, and closed conversations reject new messages and
/// metadata mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    PendingAgent,
    AgentActive,
    ClosedByAgent,
    ClosedByUser,
    Archived,
}

impl ConversationStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClosedByAgent | Self::ClosedByUser)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_closed()
    }

    /// Whether the status machine permits moving from `self` to `to`.
    pub fn can_transition_to(&self, to: ConversationStatus) -> bool {
        use ConversationStatus::*;
        match (self, to) {
            // Nothing leaves a closed state.
            (ClosedByAgent | ClosedByUser, _) => false,
            // Any non-terminal state may archive or close.
            (_, Archived) => true,
            (_, ClosedByAgent | ClosedByUser) => true,
            (Active, PendingAgent) => true,
            (PendingAgent, AgentActive) => true,
            // Escalating an already-assigned conversation re-queues it.
            (AgentActive, PendingAgent) => true,
            (Archived, PendingAgent) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::PendingAgent => write!(f, "pending_agent"),
            Self::AgentActive => write!(f, "agent_active"),
            Self::ClosedByAgent => write!(f, "closed_by_agent"),
            Self::ClosedByUser => write!(f, "closed_by_user"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "pending_agent" => Ok(Self::PendingAgent),
            "agent_active" => Ok(Self::AgentActive),
            "closed_by_agent" => Ok(Self::ClosedByAgent),
            "closed_by_user" => Ok(Self::ClosedByUser),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Escalation urgency. Out-of-range values coming from the AI are
/// normalized to `Medium` instead of rejected, so a formatting slip in a
/// tool call never blocks an escalation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
}

impl Urgency {
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("low") => Self::Low,
            Some("high") => Self::High,
            Some("medium") => Self::Medium,
            _ => Self::Medium,
        }
    }

    /// Sort weight for the escalation queue: high urgency first.
    pub fn weight(&self) -> u8 {
        match self {
            Self::High => 2,
            Self::Medium => 1,
            Self::Low => 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Note {
    pub author_id: ParticipantId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PinMark {
    pub author_id: ParticipantId,
    pub pinned_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscalationDetails {
    pub reason: String,
    pub urgency: Urgency,
    pub escalated_by_tool: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConversationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_by: Vec<PinMark>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_details: Option<EscalationDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<serde_json::Value>,
}

impl ConversationMetadata {
    /// Tags are stored lowercase and deduplicated, preserving first-seen order.
    pub fn set_tags(&mut self, tags: Vec<String>) {
        let mut seen = std::collections::HashSet::new();
        self.tags = tags
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect();
    }

    pub fn is_pinned_by(&self, id: &ParticipantId) -> bool {
        self.pinned_by.iter().any(|p| &p.author_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_states_are_terminal() {
        for closed in [ConversationStatus::ClosedByAgent, ConversationStatus::ClosedByUser] {
            assert!(closed.is_closed());
            for to in [
                ConversationStatus::Active,
                ConversationStatus::PendingAgent,
                ConversationStatus::AgentActive,
                ConversationStatus::Archived,
                ConversationStatus::ClosedByAgent,
            ] {
                assert!(!closed.can_transition_to(to), "{closed} -> {to} should be rejected");
            }
        }
    }

    #[test]
    fn escalation_and_assignment_path() {
        assert!(ConversationStatus::Active.can_transition_to(ConversationStatus::PendingAgent));
        assert!(ConversationStatus::PendingAgent.can_transition_to(ConversationStatus::AgentActive));
        assert!(ConversationStatus::AgentActive.can_transition_to(ConversationStatus::PendingAgent));
    }

    #[test]
    fn any_open_state_can_close_or_archive() {
        for from in [
            ConversationStatus::Active,
            ConversationStatus::PendingAgent,
            ConversationStatus::AgentActive,
            ConversationStatus::Archived,
        ] {
            assert!(from.can_transition_to(ConversationStatus::ClosedByAgent));
            assert!(from.can_transition_to(ConversationStatus::ClosedByUser));
        }
        assert!(ConversationStatus::Active.can_transition_to(ConversationStatus::Archived));
    }

    #[test]
    fn active_cannot_skip_to_agent_active() {
        assert!(!ConversationStatus::Active.can_transition_to(ConversationStatus::AgentActive));
    }

    #[test]
    fn status_display_from_str_roundtrip() {
        for status in [
            ConversationStatus::Active,
            ConversationStatus::PendingAgent,
            ConversationStatus::AgentActive,
            ConversationStatus::ClosedByAgent,
            ConversationStatus::ClosedByUser,
            ConversationStatus::Archived,
        ] {
            let parsed: ConversationStatus = status.to_string().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn urgency_normalizes_invalid_input() {
        assert_eq!(Urgency::normalize(Some("high")), Urgency::High);
        assert_eq!(Urgency::normalize(Some(" HIGH ")), Urgency::High);
        assert_eq!(Urgency::normalize(Some("low")), Urgency::Low);
        assert_eq!(Urgency::normalize(Some("critical")), Urgency::Medium);
        assert_eq!(Urgency::normalize(Some("")), Urgency::Medium);
        assert_eq!(Urgency::normalize(None), Urgency::Medium);
    }

    #[test]
    fn urgency_weight_ordering() {
        assert!(Urgency::High.weight() > Urgency::Medium.weight());
        assert!(Urgency::Medium.weight() > Urgency::Low.weight());
    }

    #[test]
    fn tags_lowercased_and_deduplicated() {
        let mut meta = ConversationMetadata::default();
        meta.set_tags(vec![
            "Billing".into(),
            "billing".into(),
            "  VIP ".into(),
            "".into(),
            "refund".into(),
        ]);
        assert_eq!(meta.tags, vec!["billing", "vip", "refund"]);
    }

    #[test]
    fn metadata_serde_skips_empty_fields() {
        let meta = ConversationMetadata::default();
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("title").is_none());
        assert!(json.get("escalation_details").is_none());
        assert_eq!(json["priority"], "normal");
    }

    #[test]
    fn metadata_with_escalation_roundtrip() {
        let meta = ConversationMetadata {
            escalation_details: Some(EscalationDetails {
                reason: "user demanded a human".into(),
                urgency: Urgency::High,
                escalated_by_tool: true,
                timestamp: Utc::now(),
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&meta).unwrap();
        let parsed: ConversationMetadata = serde_json::from_str(&json).unwrap();
        let details = parsed.escalation_details.unwrap();
        assert_eq!(details.urgency, Urgency::High);
        assert!(details.escalated_by_tool);
    }
}
