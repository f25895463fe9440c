
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::{ChatMessage, MessageId, Role, ThreadId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now_timestamp};

const TABLE: &str = "messages";

/// A stored message. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub role: Role,
    pub content: String,
    pub token_count: u32,
    pub created_at: String,
    pub sequence: i64,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_nick: Option<String>,
}

impl Message {
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// A message about to be appended. The store assigns id, sequence and
/// timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub token_count: u32,
    pub sender_id: Option<String>,
    pub sender_nick: Option<String>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>, token_count: u32) -> Self {
        Self {
            role,
            content: content.into(),
            token_count,
            sender_id: None,
            sender_nick: None,
        }
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>, sender_nick: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self.sender_nick = Some(sender_nick.into());
        self
    }

    /// Materialize with store-assigned fields.
    pub fn into_message(self, message_id: MessageId, thread_id: ThreadId, sequence: i64, now: String) -> Message {
        Message {
            message_id,
            thread_id,
            role: self.role,
            content: self.content,
            token_count: self.token_count,
            created_at: now,
            sequence,
            sender_id: self.sender_id,
            sender_nick: self.sender_nick,
        }
    }
}

const SELECT_COLUMNS: &str =
    "message_id, thread_id, role, content, token_count, created_at, sequence, sender_id, sender_nick";

#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message. Atomically, under the connection mutex:
    /// 1. Checks the thread exists and reads the max sequence
    /// 2. Inserts at `max + 1` and bumps `last_active_at`
    #[instrument(skip(self, new), fields(thread_id = %thread_id, role = %new.role))]
    pub fn append(&self, thread_id: &ThreadId, new: NewMessage) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let max_seq: Option<i64> = tx
                .query_row(
                    "SELECT (SELECT MAX(sequence) FROM messages WHERE thread_id = ?1)
                     FROM threads WHERE thread_id = ?1",
                    [thread_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("thread {thread_id}")),
                    other => other.into(),
                })?;

            let now = now_timestamp();
            let sequence = max_seq.map_or(0, |s| s + 1);
            let message = new.into_message(MessageId::new(), thread_id.clone(), sequence, now);

            tx.execute(
                "INSERT INTO messages (message_id, thread_id, role, content, token_count, created_at,
                                       sequence, sender_id, sender_nick)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    message.message_id.as_str(),
                    message.thread_id.as_str(),
                    message.role.as_str(),
                    message.content,
                    message.token_count,
                    message.created_at,
                    message.sequence,
                    message.sender_id,
                    message.sender_nick,
                ],
            )?;
            tx.execute(
                "UPDATE threads SET last_active_at = ?1 WHERE thread_id = ?2",
                rusqlite::params![message.created_at, thread_id.as_str()],
            )?;
            tx.commit()?;

            Ok(message)
        })
    }

    /// Messages oldest first. With `limit`, only the most recent `limit`
    /// messages, still oldest first.
    #[instrument(skip(self), fields(thread_id = %thread_id, limit))]
    pub fn list(&self, thread_id: &ThreadId, limit: Option<u32>) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match limit {
                Some(limit) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLUMNS} FROM messages WHERE thread_id = ?1
                         ORDER BY sequence DESC LIMIT ?2"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![thread_id.as_str(), limit])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_message(row)?);
                    }
                    results.reverse();
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY sequence ASC"
                    ))?;
                    let mut rows = stmt.query([thread_id.as_str()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_message(row)?);
                    }
                }
            }
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let role: String = row_helpers::get(row, 2, TABLE, "role")?;
    let token_count: i64 = row_helpers::get(row, 4, TABLE, "token_count")?;
    Ok(Message {
        message_id: MessageId::from_raw(row_helpers::get::<String>(row, 0, TABLE, "message_id")?),
        thread_id: ThreadId::from_raw(row_helpers::get::<String>(row, 1, TABLE, "thread_id")?),
        role: row_helpers::parse_enum(&role, TABLE, "role")?,
        content: row_helpers::get(row, 3, TABLE, "content")?,
        token_count: u32::try_from(token_count).map_err(|_| StoreError::CorruptRow {
            table: TABLE,
            column: "token_count",
            detail: format!("out of range: {token_count}"),
        })?,
        created_at: row_helpers::get(row, 5, TABLE, "created_at")?,
        sequence: row_helpers::get(row, 6, TABLE, "sequence")?,
        sender_id: row_helpers::get_opt(row, 7, TABLE, "sender_id")?,
        sender_nick: row_helpers::get_opt(row, 8, TABLE, "sender_nick")?,
    })
}
