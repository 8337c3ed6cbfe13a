//! Conversation and message persistence
use crate::error::{MemoryError, MemoryResult};
use crate::memory_db::schema::*;
use crate::memory_db::DbPool;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str = "id, agent_id, title, status, metadata, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, metadata, summarized, created_at";

/// Result of a committed append.
#[derive(Debug, Clone)]
pub struct AppendedMessage {
    pub message: Message,
    /// Live (non-summarized) messages in the conversation after the insert.
    pub live_count: usize,
}

#[derive(Clone)]
pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> MemoryResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn create(&self, agent_id: &str, title: &str, metadata: &Metadata) -> MemoryResult<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            title: title.to_string(),
            status: ConversationStatus::Active,
            metadata: metadata.clone(),
            created_at: now(),
            updated_at: now(),
        };
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO conversations (id, agent_id, title, status, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &conversation.id,
                &conversation.agent_id,
                &conversation.title,
                conversation.status.as_str(),
                serde_json::to_string(&conversation.metadata)?,
                format_timestamp(&conversation.created_at),
                format_timestamp(&conversation.updated_at),
            ],
        )?;
        info!("Created conversation {} for agent {}", conversation.id, agent_id);
        Ok(conversation)
    }

    pub fn get(&self, id: &str) -> MemoryResult<Option<Conversation>> {
        let conn = self.get_conn()?;
        Self::get_with_conn(&conn, id)
    }

    pub fn get_with_conn(conn: &Connection, id: &str) -> MemoryResult<Option<Conversation>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations WHERE id = ?1",
            CONVERSATION_COLUMNS
        ))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_conversation(row)?)),
            None => Ok(None),
        }
    }

    /// Conversations of an agent, most recently updated first.
    pub fn list(
        &self,
        agent_id: &str,
        status: Option<ConversationStatus>,
        limit: usize,
    ) -> MemoryResult<Vec<Conversation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations
             WHERE agent_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY updated_at DESC, rowid DESC LIMIT ?3",
            CONVERSATION_COLUMNS
        ))?;
        let mut rows = stmt.query(params![agent_id, status.map(|s| s.as_str()), limit as i64])?;
        let mut conversations = Vec::new();
        while let Some(row) = rows.next()? {
            conversations.push(row_to_conversation(row)?);
        }
        Ok(conversations)
    }

    /// Active conversations untouched since `cutoff`.
    pub fn list_stale(&self, cutoff: &chrono::DateTime<chrono::Utc>, limit: usize) -> MemoryResult<Vec<Conversation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations
             WHERE status = 'active' AND updated_at < ?1
             ORDER BY updated_at ASC LIMIT ?2",
            CONVERSATION_COLUMNS
        ))?;
        let mut rows = stmt.query(params![format_timestamp(cutoff), limit as i64])?;
        let mut conversations = Vec::new();
        while let Some(row) = rows.next()? {
            conversations.push(row_to_conversation(row)?);
        }
        Ok(conversations)
    }

    /// Active conversations whose live message count exceeds `max_live`.
    pub fn list_over_length(&self, max_live: usize, limit: usize) -> MemoryResult<Vec<Conversation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.agent_id, c.title, c.status, c.metadata, c.created_at, c.updated_at
             FROM conversations c
             WHERE c.status = 'active'
               AND (SELECT COUNT(*) FROM messages m
                    WHERE m.conversation_id = c.id AND m.summarized = 0) > ?1
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![max_live as i64, limit as i64])?;
        let mut conversations = Vec::new();
        while let Some(row) = rows.next()? {
            conversations.push(row_to_conversation(row)?);
        }
        Ok(conversations)
    }

    pub fn update(&self, id: &str, update: &ConversationUpdate) -> MemoryResult<Option<Conversation>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut conversation) = Self::get_with_conn(&tx, id)? else {
            return Ok(None);
        };

        if let Some(title) = &update.title {
            conversation.title = title.clone();
        }
        if let Some(status) = update.status {
            conversation.status = status;
        }
        if let Some(metadata) = &update.metadata {
            conversation.metadata = metadata.clone();
        }
        conversation.updated_at = now();

        tx.execute(
            "UPDATE conversations SET title = ?1, status = ?2, metadata = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                &conversation.title,
                conversation.status.as_str(),
                serde_json::to_string(&conversation.metadata)?,
                format_timestamp(&conversation.updated_at),
                id,
            ],
        )?;
        tx.commit()?;
        debug!("Updated conversation {}", id);
        Ok(Some(conversation))
    }

    /// Removes the conversation, its messages and its summaries.
    pub fn delete(&self, id: &str) -> MemoryResult<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let messages = tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [id])?;
        let summaries = tx.execute("DELETE FROM summaries WHERE conversation_id = ?1", [id])?;
        let deleted = tx.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        tx.commit()?;
        if deleted > 0 {
            info!(
                "Deleted conversation {} ({} messages, {} summaries)",
                id, messages, summaries
            );
        }
        Ok(deleted > 0)
    }

    /// Inserts a message. `None` when the conversation does not exist.
    ///
    /// The id is assigned by SQLite inside an immediate transaction, so
    /// concurrent appends to one conversation are serialized by the store.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        metadata: &Metadata,
    ) -> MemoryResult<Option<AppendedMessage>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM conversations WHERE id = ?1", [conversation_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }

        let created_at = now();
        let created_at_str = format_timestamp(&created_at);
        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, metadata, summarized, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                conversation_id,
                role.as_str(),
                content,
                serde_json::to_string(metadata)?,
                &created_at_str,
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![&created_at_str, conversation_id],
        )?;
        let live_count = Self::live_count_with_conn(&tx, conversation_id)?;
        tx.commit()?;

        Ok(Some(AppendedMessage {
            message: Message {
                id,
                conversation_id: conversation_id.to_string(),
                role,
                content: content.to_string(),
                metadata: metadata.clone(),
                summarized: false,
                created_at,
            },
            live_count,
        }))
    }

    pub fn get_message(&self, message_id: i64) -> MemoryResult<Option<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS))?;
        let mut rows = stmt.query([message_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_message(row)?)),
            None => Ok(None),
        }
    }

    /// Merges `metadata` into the message's annotations. Content is immutable.
    pub fn annotate_message(&self, message_id: i64, metadata: &Metadata) -> MemoryResult<Option<Message>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut message = {
            let mut stmt = tx.prepare(&format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS))?;
            let mut rows = stmt.query([message_id])?;
            match rows.next()? {
                Some(row) => row_to_message(row)?,
                None => return Ok(None),
            }
        };
        message
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        tx.execute(
            "UPDATE messages SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&message.metadata)?, message_id],
        )?;
        tx.commit()?;
        Ok(Some(message))
    }

    /// Live messages, newest page first, returned in ascending order.
    pub fn list_live_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before_id: Option<i64>,
    ) -> MemoryResult<Vec<Message>> {
        self.page(conversation_id, limit, before_id, true)
    }

    /// Every stored message including summarized ones, for audit.
    pub fn list_history(
        &self,
        conversation_id: &str,
        limit: usize,
        before_id: Option<i64>,
    ) -> MemoryResult<Vec<Message>> {
        self.page(conversation_id, limit, before_id, false)
    }

    fn page(
        &self,
        conversation_id: &str,
        limit: usize,
        before_id: Option<i64>,
        live_only: bool,
    ) -> MemoryResult<Vec<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE conversation_id = ?1
               AND (?2 IS NULL OR id < ?2)
               AND (?3 = 0 OR summarized = 0)
             ORDER BY id DESC LIMIT ?4",
            MESSAGE_COLUMNS
        ))?;
        let mut rows = stmt.query(params![conversation_id, before_id, live_only as i64, limit as i64])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// The oldest live messages, ascending; the next consolidation block.
    pub fn oldest_live_messages(&self, conversation_id: &str, limit: usize) -> MemoryResult<Vec<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE conversation_id = ?1 AND summarized = 0
             ORDER BY id ASC LIMIT ?2",
            MESSAGE_COLUMNS
        ))?;
        let mut rows = stmt.query(params![conversation_id, limit as i64])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    pub fn messages_in_range(&self, conversation_id: &str, start_id: i64, end_id: i64) -> MemoryResult<Vec<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE conversation_id = ?1 AND id BETWEEN ?2 AND ?3
             ORDER BY id ASC",
            MESSAGE_COLUMNS
        ))?;
        let mut rows = stmt.query(params![conversation_id, start_id, end_id])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    pub fn live_message_count(&self, conversation_id: &str) -> MemoryResult<usize> {
        let conn = self.get_conn()?;
        Self::live_count_with_conn(&conn, conversation_id)
    }

    fn live_count_with_conn(conn: &Connection, conversation_id: &str) -> MemoryResult<usize> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND summarized = 0",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn mark_summarized_with_conn(
        conn: &Connection,
        conversation_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> MemoryResult<usize> {
        let updated = conn.execute(
            "UPDATE messages SET summarized = 1
             WHERE conversation_id = ?1 AND id BETWEEN ?2 AND ?3 AND summarized = 0",
            params![conversation_id, start_id, end_id],
        )?;
        Ok(updated)
    }
}

fn row_to_conversation(row: &Row) -> MemoryResult<Conversation> {
    let status: String = row.get(3)?;
    let metadata_json: String = row.get(4)?;
    let metadata: Metadata = serde_json::from_str(&metadata_json)?;
    Ok(Conversation {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        title: row.get(2)?,
        status: status.parse()?,
        metadata,
        created_at: timestamp_column(row, 5)?,
        updated_at: timestamp_column(row, 6)?,
    })
}

fn row_to_message(row: &Row) -> MemoryResult<Message> {
    let role: String = row.get(2)?;
    let metadata_json: String = row.get(4)?;
    let summarized: i64 = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: role.parse()?,
        content: row.get(3)?,
        metadata: serde_json::from_str(&metadata_json)?,
        summarized: summarized != 0,
        created_at: timestamp_column(row, 6)?,
    })
}

pub(crate) fn timestamp_column(row: &Row, idx: usize) -> MemoryResult<chrono::DateTime<chrono::Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        warn!("Unparseable timestamp '{}' in column {}", raw, idx);
        MemoryError::Store(format!("invalid timestamp '{}'", raw))
    })
}
