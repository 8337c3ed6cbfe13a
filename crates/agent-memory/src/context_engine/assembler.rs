//! Context bundle assembly
use crate::config::MemoryConfig;
use crate::context_engine::context_builder::{item_size, ContextBuilder, DroppedCounts};
use crate::conversation::manager::{validate_identifier, validate_limit};
use crate::conversation::ConversationManager;
use crate::error::{MemoryError, MemoryResult};
use crate::knowledge::{KnowledgeManager, SearchQuery};
use crate::memory_db::{Conversation, KnowledgeEntry, Message, Summary};
use crate::utils::TopicExtractor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where the assembler reads from.
#[async_trait]
pub trait ContextSources: Send + Sync {
    async fn conversation(&self, conversation_id: &str) -> MemoryResult<Conversation>;

    async fn latest_conversation(&self, agent_id: &str) -> MemoryResult<Option<Conversation>>;

    /// Up to `limit` most recent live messages, ascending.
    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> MemoryResult<Vec<Message>>;

    /// Summaries ordered by covered range.
    async fn summaries(&self, conversation_id: &str) -> MemoryResult<Vec<Summary>>;

    /// Ranked knowledge for `query`; an empty query ranks by recency.
    async fn knowledge(&self, query: &str, limit: usize) -> MemoryResult<Vec<KnowledgeEntry>>;
}

/// Sources backed by the managers, and so by the cache and the store.
pub struct ManagerSources {
    conversations: Arc<ConversationManager>,
    knowledge: Arc<KnowledgeManager>,
}

impl ManagerSources {
    pub fn new(conversations: Arc<ConversationManager>, knowledge: Arc<KnowledgeManager>) -> Self {
        Self {
            conversations,
            knowledge,
        }
    }
}

#[async_trait]
impl ContextSources for ManagerSources {
    async fn conversation(&self, conversation_id: &str) -> MemoryResult<Conversation> {
        self.conversations.get(conversation_id).await
    }

    async fn latest_conversation(&self, agent_id: &str) -> MemoryResult<Option<Conversation>> {
        self.conversations.most_recent_active(agent_id).await
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> MemoryResult<Vec<Message>> {
        self.conversations.list_messages(conversation_id, limit, None).await
    }

    async fn summaries(&self, conversation_id: &str) -> MemoryResult<Vec<Summary>> {
        self.conversations.list_summaries(conversation_id).await
    }

    async fn knowledge(&self, query: &str, limit: usize) -> MemoryResult<Vec<KnowledgeEntry>> {
        let results = self
            .knowledge
            .search(&SearchQuery {
                query: query.to_string(),
                limit,
                ..Default::default()
            })
            .await?;
        Ok(results.into_iter().map(|scored| scored.entry).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRequest {
    pub agent_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Defaults to `context_window_size`.
    #[serde(default)]
    pub max_messages: Option<usize>,
    #[serde(default = "default_true")]
    pub include_knowledge: bool,
    #[serde(default = "default_true")]
    pub include_summaries: bool,
}

fn default_true() -> bool {
    true
}

impl ContextRequest {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            conversation_id: None,
            max_messages: None,
            include_knowledge: true,
            include_summaries: true,
        }
    }

    pub fn for_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub agent_id: String,
    pub conversation_id: Option<String>,
    pub recent_messages: Vec<Message>,
    pub summaries: Vec<Summary>,
    pub knowledge: Vec<KnowledgeEntry>,
    /// Length of the bundle's own JSON form, this field included.
    pub total_size: usize,
    /// A summary or knowledge fetch failed or timed out.
    pub partial: bool,
    pub dropped: DroppedCounts,
}

pub struct ContextAssembler {
    sources: Arc<dyn ContextSources>,
    config: Arc<MemoryConfig>,
    topics: TopicExtractor,
}

impl ContextAssembler {
    pub fn new(sources: Arc<dyn ContextSources>, config: Arc<MemoryConfig>) -> Self {
        Self {
            sources,
            config,
            topics: TopicExtractor::default(),
        }
    }

    pub async fn get_context(&self, request: &ContextRequest) -> MemoryResult<ContextBundle> {
        validate_identifier("agent id", &request.agent_id)?;
        let max_messages = request.max_messages.unwrap_or(self.config.context_window_size);
        validate_limit(max_messages)?;
        let hard = self.config.store_timeout();

        let conversation = match &request.conversation_id {
            Some(id) => {
                let conversation = hard_fetch("get_conversation", hard, self.sources.conversation(id)).await?;
                if conversation.agent_id != request.agent_id {
                    return Err(MemoryError::not_found("conversation", id.clone()));
                }
                Some(conversation)
            }
            None => hard_fetch("latest_conversation", hard, self.sources.latest_conversation(&request.agent_id)).await?,
        };
        let conversation_id = conversation.map(|c| c.id);

        let messages = match &conversation_id {
            Some(id) => hard_fetch("recent_messages", hard, self.sources.recent_messages(id, max_messages)).await?,
            None => Vec::new(),
        };

        let soft = self.config.context_soft_timeout();
        let query = self
            .topics
            .extract_from_messages(&messages, self.config.context_window_size)
            .join(" ");
        let summaries_fetch = async {
            match (&conversation_id, request.include_summaries) {
                (Some(id), true) => soft_fetch("summaries", soft, self.sources.summaries(id)).await,
                _ => Some(Vec::new()),
            }
        };
        let knowledge_fetch = async {
            if request.include_knowledge {
                soft_fetch(
                    "knowledge",
                    soft,
                    self.sources.knowledge(&query, self.config.context_knowledge_candidates),
                )
                .await
            } else {
                Some(Vec::new())
            }
        };
        let (summaries, knowledge) = tokio::join!(summaries_fetch, knowledge_fetch);
        let partial = summaries.is_none() || knowledge.is_none();

        let built = ContextBuilder::new(self.config.context_budget_bytes).build(
            messages,
            summaries.unwrap_or_default(),
            knowledge.unwrap_or_default(),
        );
        let mut bundle = ContextBundle {
            agent_id: request.agent_id.clone(),
            conversation_id,
            recent_messages: built.messages,
            summaries: built.summaries,
            knowledge: built.knowledge,
            total_size: 0,
            partial,
            dropped: built.dropped,
        };
        bundle.fit_to(self.config.context_budget_bytes)?;
        crate::metrics::observe_context_bytes(bundle.total_size);
        debug!(
            "Assembled context for agent {}: {} messages, {} summaries, {} knowledge, {} bytes{}",
            request.agent_id,
            bundle.recent_messages.len(),
            bundle.summaries.len(),
            bundle.knowledge.len(),
            bundle.total_size,
            if partial { " (partial)" } else { "" }
        );
        Ok(bundle)
    }
}

impl ContextBundle {
    /// Trims the bundle until its serialized form fits `budget`: knowledge
    /// from the lowest rank, then the oldest summaries, then the oldest live
    /// messages. Fails when even the empty envelope is over budget.
    fn fit_to(&mut self, budget: usize) -> MemoryResult<()> {
        loop {
            self.settle_total_size();
            if self.total_size <= budget {
                return Ok(());
            }
            if self.knowledge.pop().is_some() {
                self.dropped.knowledge += 1;
            } else if !self.summaries.is_empty() {
                self.summaries.remove(0);
                self.dropped.summaries += 1;
            } else if !self.recent_messages.is_empty() {
                self.recent_messages.remove(0);
                self.dropped.messages += 1;
            } else {
                return Err(MemoryError::Validation(format!(
                    "context budget of {} bytes cannot hold the {} byte bundle envelope",
                    budget, self.total_size
                )));
            }
        }
    }

    /// `total_size` is part of what it measures, so settle on a value whose
    /// own digits are accounted for.
    fn settle_total_size(&mut self) {
        for _ in 0..4 {
            let size = item_size(&*self);
            if size == self.total_size {
                return;
            }
            self.total_size = size;
        }
    }
}

/// A fetch the bundle cannot do without.
async fn hard_fetch<T, F>(what: &'static str, deadline: Duration, fetch: F) -> MemoryResult<T>
where
    F: Future<Output = MemoryResult<T>>,
{
    match tokio::time::timeout(deadline, fetch).await {
        Ok(result) => result,
        Err(_) => Err(MemoryError::StoreTimeout(what.to_string())),
    }
}

/// A fetch whose failure only makes the bundle partial.
async fn soft_fetch<T, F>(what: &'static str, deadline: Duration, fetch: F) -> Option<T>
where
    F: Future<Output = MemoryResult<T>>,
{
    match tokio::time::timeout(deadline, fetch).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Context {} fetch failed, continuing without it: {}", what, e);
            None
        }
        Err(_) => {
            warn!("Context {} fetch timed out after {:?}, continuing without it", what, deadline);
            None
        }
    }
}
