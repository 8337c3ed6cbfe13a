//! Conversation threads and their ordered messages
use crate::cache_management::MemoryCache;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::memory_db::*;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_IDENTIFIER_LEN: usize = 256;
const MAX_TITLE_LEN: usize = 1024;
const MAX_PAGE_SIZE: usize = 10_000;

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: Message,
    pub live_message_count: usize,
    /// The live window is past `max_conversation_length`.
    pub length_exceeded: bool,
    /// A background consolidation pass was started for the conversation.
    pub consolidation_scheduled: bool,
}

pub struct ConversationManager {
    db: Arc<MemoryDatabase>,
    cache: Arc<MemoryCache>,
    config: Arc<MemoryConfig>,
}

impl ConversationManager {
    pub fn new(db: Arc<MemoryDatabase>, cache: Arc<MemoryCache>, config: Arc<MemoryConfig>) -> Self {
        Self { db, cache, config }
    }

    pub async fn create(&self, agent_id: &str, title: &str, metadata: &Metadata) -> MemoryResult<Conversation> {
        validate_identifier("agent id", agent_id)?;
        validate_title(title)?;

        let agent_id = agent_id.to_string();
        let title = title.trim().to_string();
        let metadata = metadata.clone();
        self.db
            .write("create_conversation", move |db| {
                db.conversations.create(&agent_id, &title, &metadata)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> MemoryResult<Conversation> {
        let key = self.cache.conversation_key(id);
        let owned = id.to_string();
        self.cache
            .conversations
            .read_through(key, || async {
                self.db
                    .read("get_conversation", move |db| db.conversations.get(&owned))
                    .await?
                    .ok_or_else(|| MemoryError::not_found("conversation", id))
            })
            .await
    }

    /// An agent's conversations, most recently updated first.
    pub async fn list(
        &self,
        agent_id: &str,
        status: Option<ConversationStatus>,
        limit: usize,
    ) -> MemoryResult<Vec<Conversation>> {
        validate_identifier("agent id", agent_id)?;
        validate_limit(limit)?;
        let agent_id = agent_id.to_string();
        self.db
            .read("list_conversations", move |db| db.conversations.list(&agent_id, status, limit))
            .await
    }

    /// The agent's most recently updated active conversation.
    pub async fn most_recent_active(&self, agent_id: &str) -> MemoryResult<Option<Conversation>> {
        Ok(self
            .list(agent_id, Some(ConversationStatus::Active), 1)
            .await?
            .into_iter()
            .next())
    }

    pub async fn update(&self, id: &str, update: ConversationUpdate) -> MemoryResult<Conversation> {
        if let Some(title) = &update.title {
            validate_title(title)?;
        }
        let owned = id.to_string();
        let result = self
            .db
            .write("update_conversation", move |db| db.conversations.update(&owned, &update))
            .await;
        self.cache.invalidate_conversation(id).await;
        result?.ok_or_else(|| MemoryError::not_found("conversation", id))
    }

    pub async fn archive(&self, id: &str) -> MemoryResult<Conversation> {
        info!("Archiving conversation {}", id);
        self.update(
            id,
            ConversationUpdate {
                status: Some(ConversationStatus::Archived),
                ..Default::default()
            },
        )
        .await
    }

    /// Deletes a conversation with its messages and summaries. Knowledge
    /// entries extracted from it are kept.
    pub async fn delete(&self, id: &str) -> MemoryResult<()> {
        let owned = id.to_string();
        let result = self
            .db
            .write("delete_conversation", move |db| db.conversations.delete(&owned))
            .await;
        self.cache.forget_conversation(id).await;
        if result? {
            Ok(())
        } else {
            Err(MemoryError::not_found("conversation", id))
        }
    }

    /// Appends a message. Going past the length bound is reported in the
    /// outcome; the write itself always succeeds.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        metadata: &Metadata,
    ) -> MemoryResult<AppendOutcome> {
        self.validate_content(content)?;

        let id = conversation_id.to_string();
        let content = content.to_string();
        let metadata = metadata.clone();
        let result = self
            .db
            .write("append_message", move |db| {
                db.conversations.append_message(&id, role, &content, &metadata)
            })
            .await;
        self.cache.invalidate_conversation(conversation_id).await;

        let appended = result?.ok_or_else(|| MemoryError::not_found("conversation", conversation_id))?;
        let length_exceeded = appended.live_count > self.config.max_conversation_length;
        if length_exceeded {
            debug!(
                "Conversation {} has {} live messages (limit {})",
                conversation_id, appended.live_count, self.config.max_conversation_length
            );
        }
        Ok(AppendOutcome {
            message: appended.message,
            live_message_count: appended.live_count,
            length_exceeded,
            consolidation_scheduled: false,
        })
    }

    pub async fn get_message(&self, message_id: i64) -> MemoryResult<Message> {
        self.db
            .read("get_message", move |db| db.conversations.get_message(message_id))
            .await?
            .ok_or_else(|| MemoryError::not_found("message", message_id.to_string()))
    }

    /// Merges annotation keys into a message's metadata.
    pub async fn annotate_message(&self, message_id: i64, metadata: &Metadata) -> MemoryResult<Message> {
        let metadata = metadata.clone();
        let message = self
            .db
            .write("annotate_message", move |db| {
                db.conversations.annotate_message(message_id, &metadata)
            })
            .await?
            .ok_or_else(|| MemoryError::not_found("message", message_id.to_string()))?;
        self.cache.invalidate_conversation(&message.conversation_id).await;
        Ok(message)
    }

    /// Live messages in ascending id order. `before_id` pages backward from
    /// the most recent message.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before_id: Option<i64>,
    ) -> MemoryResult<Vec<Message>> {
        validate_limit(limit)?;
        self.get(conversation_id).await?;

        let key = self.cache.page_key(conversation_id, limit, before_id);
        let id = conversation_id.to_string();
        self.cache
            .message_pages
            .read_through(key, || async {
                self.db
                    .read("list_messages", move |db| {
                        db.conversations.list_live_messages(&id, limit, before_id)
                    })
                    .await
            })
            .await
    }

    /// Every stored message including summarized ones.
    pub async fn list_message_history(
        &self,
        conversation_id: &str,
        limit: usize,
        before_id: Option<i64>,
    ) -> MemoryResult<Vec<Message>> {
        validate_limit(limit)?;
        self.get(conversation_id).await?;
        let id = conversation_id.to_string();
        self.db
            .read("list_message_history", move |db| db.conversations.list_history(&id, limit, before_id))
            .await
    }

    /// Summaries of a conversation ordered by covered range.
    pub async fn list_summaries(&self, conversation_id: &str) -> MemoryResult<Vec<Summary>> {
        self.get(conversation_id).await?;
        let key = self.cache.conversation_key(conversation_id);
        let id = conversation_id.to_string();
        self.cache
            .summaries
            .read_through(key, || async {
                self.db
                    .read("list_summaries", move |db| db.summaries.list_for_conversation(&id))
                    .await
            })
            .await
    }

    pub async fn live_message_count(&self, conversation_id: &str) -> MemoryResult<usize> {
        let id = conversation_id.to_string();
        self.db
            .read("live_message_count", move |db| db.conversations.live_message_count(&id))
            .await
    }

    fn validate_content(&self, content: &str) -> MemoryResult<()> {
        if content.trim().is_empty() {
            return Err(MemoryError::validation("message content cannot be empty"));
        }
        if content.len() > self.config.max_message_bytes {
            return Err(MemoryError::validation(format!(
                "message content exceeds {} bytes",
                self.config.max_message_bytes
            )));
        }
        if content.contains('\0') {
            return Err(MemoryError::validation("message content contains NUL bytes"));
        }
        Ok(())
    }
}

pub(crate) fn validate_identifier(what: &str, value: &str) -> MemoryResult<()> {
    if value.is_empty() {
        return Err(MemoryError::validation(format!("{} cannot be empty", what)));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(MemoryError::validation(format!(
            "{} too long (max {} chars)",
            what, MAX_IDENTIFIER_LEN
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(MemoryError::validation(format!("{} contains invalid characters", what)));
    }
    Ok(())
}

fn validate_title(title: &str) -> MemoryResult<()> {
    if title.trim().is_empty() {
        return Err(MemoryError::validation("title cannot be empty"));
    }
    if title.len() > MAX_TITLE_LEN || title.contains('\0') {
        return Err(MemoryError::validation("title is too long or contains NUL bytes"));
    }
    Ok(())
}

pub(crate) fn validate_limit(limit: usize) -> MemoryResult<()> {
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(MemoryError::validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    Ok(())
}
