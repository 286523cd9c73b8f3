use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::{ConversationId, MessageId, ParticipantId, ToolCallId};
use parley_core::message::{MessageKind, Sender, TokenUsage, ToolCall};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: Sender,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub receiver_id: Option<ParticipantId>,
    pub model_id: Option<String>,
    pub tool_call_id: Option<ToolCallId>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    pub read_by: Vec<ParticipantId>,
    pub is_error: bool,
    pub created_at: String,
}

impl MessageRow {
    pub fn is_read_by(&self, id: &ParticipantId) -> bool {
        self.read_by.iter().any(|r| r == id)
    }
}

/// Insert parameters. The repo assigns id and timestamp.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender: Sender,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub receiver_id: Option<ParticipantId>,
    pub model_id: Option<String>,
    pub tool_call_id: Option<ToolCallId>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    pub is_error: bool,
}

impl NewMessage {
    pub fn text(
        conversation_id: ConversationId,
        sender: Sender,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            sender,
            kind,
            content: Some(content.into()),
            receiver_id: None,
            model_id: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
            usage: None,
            is_error: false,
        }
    }
}

const SELECT_COLUMNS: &str =
    "id, conversation_id, sender, kind, content, receiver_id, model_id, tool_call_id, \
     tool_calls, usage, read_by, is_error, created_at";

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id, kind = %message.kind))]
    pub fn insert(&self, message: NewMessage) -> Result<MessageRow, StoreError> {
        let id = MessageId::new();
        let now = Utc::now().to_rfc3339();

        let row = MessageRow {
            id: id.clone(),
            conversation_id: message.conversation_id,
            sender: message.sender,
            kind: message.kind,
            content: message.content,
            receiver_id: message.receiver_id,
            model_id: message.model_id,
            tool_call_id: message.tool_call_id,
            tool_calls: message.tool_calls,
            usage: message.usage,
            read_by: Vec::new(),
            is_error: message.is_error,
            created_at: now.clone(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages
                     (id, conversation_id, sender, kind, content, receiver_id, model_id,
                      tool_call_id, tool_calls, usage, read_by, is_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, '[]', ?11, ?12)",
                rusqlite::params![
                    row.id.as_str(),
                    row.conversation_id.as_str(),
                    serde_json::to_string(&row.sender)?,
                    row.kind.to_string(),
                    row.content,
                    row.receiver_id.as_ref().map(|r| r.as_str()),
                    row.model_id,
                    row.tool_call_id.as_ref().map(|t| t.as_str()),
                    serde_json::to_string(&row.tool_calls)?,
                    row.usage.map(|u| serde_json::to_string(&u)).transpose()?,
                    row.is_error,
                    now,
                ],
            )?;
            Ok(())
        })?;

        Ok(row)
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// Messages in a conversation, newest first. `before` is an exclusive
    /// cursor: the id of the oldest message from the previous page. Paging
    /// compares on (created_at, id) so rows sharing a timestamp are never
    /// skipped across pages.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn list(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let cursor = match before {
                Some(message_id) => {
                    let mut stmt =
                        conn.prepare("SELECT created_at, id FROM messages WHERE id = ?1")?;
                    let mut rows = stmt.query([message_id])?;
                    match rows.next()? {
                        Some(row) => {
                            let created_at: String = row.get(0)?;
                            let id: String = row.get(1)?;
                            Some((created_at, id))
                        }
                        None => {
                            return Err(StoreError::NotFound(format!(
                                "cursor message {message_id}"
                            )))
                        }
                    }
                }
                None => None,
            };

            let (sql, params): (String, Vec<String>) = match cursor {
                Some((created_at, id)) => (
                    format!(
                        "SELECT {SELECT_COLUMNS} FROM messages
                         WHERE conversation_id = ?1
                           AND (created_at < ?2 OR (created_at = ?2 AND id < ?3))
                         ORDER BY created_at DESC, id DESC LIMIT ?4"
                    ),
                    vec![
                        conversation_id.as_str().to_string(),
                        created_at,
                        id,
                        limit.to_string(),
                    ],
                ),
                None => (
                    format!(
                        "SELECT {SELECT_COLUMNS} FROM messages
                         WHERE conversation_id = ?1
                         ORDER BY created_at DESC, id DESC LIMIT ?2"
                    ),
                    vec![conversation_id.as_str().to_string(), limit.to_string()],
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// The last `n` prompt-relevant messages (user queries, assistant
    /// replies, tool results), returned oldest → newest for the provider.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn recent_prompt_messages(
        &self,
        conversation_id: &ConversationId,
        n: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                   AND kind IN ('user_query', 'ia_response', 'tool_result')
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params![conversation_id.as_str(), n])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }

    /// Add `reader` to the read set. Idempotent: re-reading leaves a
    /// single entry. The read set only ever grows.
    #[instrument(skip(self), fields(message_id = %id, reader = %reader))]
    pub fn mark_read(
        &self,
        id: &MessageId,
        reader: &ParticipantId,
    ) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut message = match rows.next()? {
                Some(row) => row_to_message(row)?,
                None => return Err(StoreError::NotFound(format!("message {id}"))),
            };
            drop(rows);
            drop(stmt);

            if !message.is_read_by(reader) {
                message.read_by.push(reader.clone());
                conn.execute(
                    "UPDATE messages SET read_by = ?1 WHERE id = ?2",
                    rusqlite::params![serde_json::to_string(&message.read_by)?, id.as_str()],
                )?;
            }
            Ok(message)
        })
    }

    /// Whether a prior assistant message in this conversation requested the
    /// given tool call. Guards the tool_result ↔ tool_call linkage.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, tool_call_id = %tool_call_id))]
    pub fn assistant_tool_call_exists(
        &self,
        conversation_id: &ConversationId,
        tool_call_id: &ToolCallId,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM messages, json_each(messages.tool_calls)
                     WHERE messages.conversation_id = ?1
                       AND messages.kind = 'ia_response'
                       AND json_extract(json_each.value, '$.id') = ?2
                 )",
                rusqlite::params![conversation_id.as_str(), tool_call_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let sender_raw: String = row_helpers::get(row, 2, "messages", "sender")?;
    let kind_str: String = row_helpers::get(row, 3, "messages", "kind")?;
    let tool_calls_raw: String = row_helpers::get(row, 8, "messages", "tool_calls")?;
    let usage_raw: Option<String> = row_helpers::get_opt(row, 9, "messages", "usage")?;
    let read_by_raw: String = row_helpers::get(row, 10, "messages", "read_by")?;

    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row, 1, "messages", "conversation_id",
        )?),
        sender: row_helpers::parse_json(&sender_raw, "messages", "sender")?,
        kind: row_helpers::parse_enum(&kind_str, "messages", "kind")?,
        content: row_helpers::get_opt(row, 4, "messages", "content")?,
        receiver_id: row_helpers::get_opt::<String>(row, 5, "messages", "receiver_id")?
            .map(ParticipantId::from_raw),
        model_id: row_helpers::get_opt(row, 6, "messages", "model_id")?,
        tool_call_id: row_helpers::get_opt::<String>(row, 7, "messages", "tool_call_id")?
            .map(ToolCallId::from_raw),
        tool_calls: row_helpers::parse_json(&tool_calls_raw, "messages", "tool_calls")?,
        usage: usage_raw
            .map(|raw| row_helpers::parse_json(&raw, "messages", "usage"))
            .transpose()?,
        read_by: row_helpers::parse_json(&read_by_raw, "messages", "read_by")?,
        is_error: row_helpers::get(row, 11, "messages", "is_error")?,
        created_at: row_helpers::get(row, 12, "messages", "created_at")?,
    })
}
