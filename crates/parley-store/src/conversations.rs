use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::conversation::{ConversationKind, ConversationMetadata, ConversationStatus};
use parley_core::ids::{ConversationId, MessageId, ParticipantId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Deterministic upsert key for a direct conversation: the sorted
/// participant pair, so both directions land on the same row.
pub fn direct_pair_key(a: &ParticipantId, b: &ParticipantId) -> String {
    let (lo, hi) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
    format!("direct:{lo}:{hi}")
}

/// Upsert key for an AI conversation: one thread per user+model.
pub fn ai_pair_key(user: &ParticipantId, model_id: &str) -> String {
    format!("ia:{user}:{model_id}")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub pair_key: String,
    pub kind: ConversationKind,
    pub status: ConversationStatus,
    pub agent_id: Option<ParticipantId>,
    pub model_id: Option<String>,
    pub last_message_id: Option<MessageId>,
    pub participants: Vec<ParticipantId>,
    /// participant id → count of messages not yet acknowledged as read.
    pub unread_counts: BTreeMap<String, u32>,
    pub metadata: ConversationMetadata,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationRow {
    pub fn is_participant(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| p == id)
    }

    pub fn unread_for(&self, id: &ParticipantId) -> u32 {
        self.unread_counts.get(id.as_str()).copied().unwrap_or(0)
    }
}

const SELECT_COLUMNS: &str =
    "id, pair_key, kind, status, agent_id, model_id, last_message_id, participants, \
     unread_counts, metadata, created_at, updated_at";

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Find the conversation for `pair_key`, creating it if absent.
    /// `INSERT .. ON CONFLICT DO NOTHING` followed by a select keeps
    /// concurrent first messages from creating duplicates.
    /// Returns the row and whether this call created it.
    #[instrument(skip(self, participants), fields(pair_key))]
    pub fn find_or_create(
        &self,
        pair_key: &str,
        kind: ConversationKind,
        participants: &[ParticipantId],
        model_id: Option<&str>,
    ) -> Result<(ConversationRow, bool), StoreError> {
        if participants.is_empty() {
            return Err(StoreError::Conflict("conversation needs at least one participant".into()));
        }
        let mut unique = participants.to_vec();
        unique.sort();
        unique.dedup();

        let id = ConversationId::new();
        let now = Utc::now().to_rfc3339();
        let participants_json = serde_json::to_string(&unique)?;
        let metadata_json = serde_json::to_string(&ConversationMetadata::default())?;

        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO conversations
                     (id, pair_key, kind, status, model_id, participants, unread_counts, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, '{}', ?6, ?7, ?7)
                 ON CONFLICT(pair_key) DO NOTHING",
                rusqlite::params![
                    id.as_str(),
                    pair_key,
                    kind.to_string(),
                    model_id,
                    participants_json,
                    metadata_json,
                    now,
                ],
            )?;

            let sql = format!("SELECT {SELECT_COLUMNS} FROM conversations WHERE pair_key = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([pair_key])?;
            match rows.next()? {
                Some(row) => Ok((row_to_conversation(row)?, inserted > 0)),
                None => Err(StoreError::NotFound(format!("conversation pair {pair_key}"))),
            }
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM conversations WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }

    /// Conversations a participant belongs to, most recently active first.
    #[instrument(skip(self), fields(participant = %participant))]
    pub fn list_for_participant(
        &self,
        participant: &ParticipantId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM conversations
                 WHERE EXISTS (
                     SELECT 1 FROM json_each(conversations.participants)
                     WHERE json_each.value = ?1
                 )
                 ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params![participant.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })
    }

    /// All conversations waiting for an agent. Ordering by urgency happens
    /// in the service, since urgency lives inside the metadata JSON.
    #[instrument(skip(self))]
    pub fn list_pending_agent(&self) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM conversations
                 WHERE status = 'pending_agent'
                 ORDER BY updated_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id, status = %status))]
    pub fn update_status(
        &self,
        id: &ConversationId,
        status: ConversationStatus,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Assignment is one write: agent id, status, kind, the agent joining
    /// the participant set, and the agent's unread count starting at zero.
    #[instrument(skip(self), fields(conversation_id = %id, agent_id = %agent_id))]
    pub fn assign_agent(
        &self,
        id: &ConversationId,
        agent_id: &ParticipantId,
    ) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut row = select_conversation(conn, id)?;
            if !row.is_participant(agent_id) {
                row.participants.push(agent_id.clone());
            }
            row.agent_id = Some(agent_id.clone());
            row.status = ConversationStatus::AgentActive;
            row.kind = ConversationKind::UserToAgent;
            row.unread_counts.insert(agent_id.as_str().to_string(), 0);
            write_conversation(conn, &row)?;
            select_conversation(conn, id)
        })
    }

    /// Increment the unread count of every participant except `sender`.
    /// `sender = None` (AI/tool/system messages) increments everyone.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn bump_unread(
        &self,
        id: &ConversationId,
        sender: Option<&ParticipantId>,
        last_message_id: &MessageId,
    ) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut row = select_conversation(conn, id)?;
            for participant in row.participants.clone() {
                if Some(&participant) == sender {
                    continue;
                }
                let count = row.unread_counts.entry(participant.as_str().to_string()).or_insert(0);
                *count += 1;
            }
            row.last_message_id = Some(last_message_id.clone());
            write_conversation(conn, &row)?;
            select_conversation(conn, id)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id, participant = %participant))]
    pub fn reset_unread(
        &self,
        id: &ConversationId,
        participant: &ParticipantId,
    ) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut row = select_conversation(conn, id)?;
            row.unread_counts.insert(participant.as_str().to_string(), 0);
            write_conversation(conn, &row)?;
            select_conversation(conn, id)
        })
    }

    /// Apply a closure to the metadata and persist the result. The
    /// connection mutex is held across read and write, so concurrent
    /// mutators cannot lose updates.
    #[instrument(skip(self, mutate), fields(conversation_id = %id))]
    pub fn with_metadata<F>(
        &self,
        id: &ConversationId,
        mutate: F,
    ) -> Result<ConversationRow, StoreError>
    where
        F: FnOnce(&mut ConversationMetadata),
    {
        self.db.with_conn(|conn| {
            let mut row = select_conversation(conn, id)?;
            mutate(&mut row.metadata);
            write_conversation(conn, &row)?;
            select_conversation(conn, id)
        })
    }
}

fn select_conversation(
    conn: &rusqlite::Connection,
    id: &ConversationId,
) -> Result<ConversationRow, StoreError> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM conversations WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_conversation(row),
        None => Err(StoreError::NotFound(format!("conversation {id}"))),
    }
}

fn write_conversation(
    conn: &rusqlite::Connection,
    row: &ConversationRow,
) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE conversations SET
            kind = ?1, status = ?2, agent_id = ?3, model_id = ?4, last_message_id = ?5,
            participants = ?6, unread_counts = ?7, metadata = ?8, updated_at = ?9
         WHERE id = ?10",
        rusqlite::params![
            row.kind.to_string(),
            row.status.to_string(),
            row.agent_id.as_ref().map(|a| a.as_str()),
            row.model_id,
            row.last_message_id.as_ref().map(|m| m.as_str()),
            serde_json::to_string(&row.participants)?,
            serde_json::to_string(&row.unread_counts)?,
            serde_json::to_string(&row.metadata)?,
            now,
            row.id.as_str(),
        ],
    )?;
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    let kind_str: String = row_helpers::get(row, 2, "conversations", "kind")?;
    let status_str: String = row_helpers::get(row, 3, "conversations", "status")?;
    let participants_raw: String = row_helpers::get(row, 7, "conversations", "participants")?;
    let unread_raw: String = row_helpers::get(row, 8, "conversations", "unread_counts")?;
    let metadata_raw: String = row_helpers::get(row, 9, "conversations", "metadata")?;

    Ok(ConversationRow {
        id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, "conversations", "id")?),
        pair_key: row_helpers::get(row, 1, "conversations", "pair_key")?,
        kind: row_helpers::parse_enum(&kind_str, "conversations", "kind")?,
        status: row_helpers::parse_enum(&status_str, "conversations", "status")?,
        agent_id: row_helpers::get_opt::<String>(row, 4, "conversations", "agent_id")?
            .map(ParticipantId::from_raw),
        model_id: row_helpers::get_opt(row, 5, "conversations", "model_id")?,
        last_message_id: row_helpers::get_opt::<String>(row, 6, "conversations", "last_message_id")?
            .map(MessageId::from_raw),
        participants: row_helpers::parse_json(&participants_raw, "conversations", "participants")?,
        unread_counts: row_helpers::parse_json(&unread_raw, "conversations", "unread_counts")?,
        metadata: row_helpers::parse_json(&metadata_raw, "conversations", "metadata")?,
        created_at: row_helpers::get(row, 10, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 11, "conversations", "updated_at")?,
    })
}
