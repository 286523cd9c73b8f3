use serde::{Deserialize, Serialize};

use crate::ids::ParticipantId;

/// Participant role, assigned by the external identity service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    Admin,
}

impl Role {
    /// Agents and admins share the staff-only surfaces (escalation queue,
    /// metadata edits, assignment).
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Agent | Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// An authenticated participant. The core never issues identities; the
/// transport hands this over once the connection has authenticated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: ParticipantId,
    pub role: Role,
}

impl Identity {
    pub fn new(id: ParticipantId, role: Role) -> Self {
        Self { id, role }
    }

    pub fn user(id: ParticipantId) -> Self {
        Self::new(id, Role::User)
    }

    pub fn agent(id: ParticipantId) -> Self {
        Self::new(id, Role::Agent)
    }

    pub fn admin(id: ParticipantId) -> Self {
        Self::new(id, Role::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staff_roles() {
        assert!(!Role::User.is_staff());
        assert!(Role::Agent.is_staff());
        assert!(Role::Admin.is_staff());
    }

    #[test]
    fn role_display_from_str_roundtrip() {
        for role in [Role::User, Role::Agent, Role::Admin] {
            let parsed: Role = role.to_string().parse().unwrap();
            assert_eq!(role, parsed);
        }
    }

    #[test]
    fn unknown_role_rejected() {
        assert!("superuser".parse::<Role>().is_err());
    }

    #[test]
    fn identity_serde() {
        let identity = Identity::agent(ParticipantId::from_raw("agent-7"));
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["id"], "agent-7");
        assert_eq!(json["role"], "agent");
    }
}
