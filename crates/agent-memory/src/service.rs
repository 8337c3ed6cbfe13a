//! Memory service facade
//!
//! Wires the store, cache, managers, consolidation engine and context
//! assembler together and exposes the operations callers use.
use crate::cache_management::{CacheStatsSnapshot, MemoryCache};
use crate::config::MemoryConfig;
use crate::consolidation::{
    summarizer, ConsolidationEngine, ConsolidationOutcome, ConsolidationTrigger, RetentionSweeper, Summarizer,
};
use crate::context_engine::{ContextAssembler, ContextBundle, ContextRequest, ContextSources, ManagerSources};
use crate::conversation::{AppendOutcome, ConversationManager};
use crate::error::MemoryResult;
use crate::knowledge::{KnowledgeManager, ScoredEntry, SearchQuery};
use crate::memory_db::*;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub conversations: i64,
    pub active_conversations: i64,
    pub messages: i64,
    pub live_messages: i64,
    pub summaries: i64,
    pub knowledge_items: i64,
    pub consolidations_completed: u64,
    pub extraction_failures: u64,
    pub consolidations_in_flight: usize,
    pub cache: CacheStatsSnapshot,
    pub database_size_bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub store_ok: bool,
    pub store_error: Option<String>,
    pub cache_entries: u64,
    pub consolidations_in_flight: usize,
}

pub struct MemoryService {
    config: Arc<MemoryConfig>,
    db: Arc<MemoryDatabase>,
    cache: Arc<MemoryCache>,
    conversations: Arc<ConversationManager>,
    knowledge: Arc<KnowledgeManager>,
    engine: Arc<ConsolidationEngine>,
    assembler: ContextAssembler,
}

impl MemoryService {
    /// Opens the on-disk store named by the configuration.
    pub fn open(config: MemoryConfig) -> MemoryResult<Self> {
        config.validate()?;
        let db = MemoryDatabase::with_policy(&config.database_path, StorePolicy::from_config(&config))?;
        let summarizer = summarizer::from_config(&config);
        Ok(Self::with_parts(config, db, summarizer))
    }

    /// Private in-memory store, for embedding and tests.
    pub fn in_memory(config: MemoryConfig, summarizer: Arc<dyn Summarizer>) -> MemoryResult<Self> {
        config.validate()?;
        Ok(Self::with_parts(config, MemoryDatabase::new_in_memory()?, summarizer))
    }

    pub fn with_parts(config: MemoryConfig, db: MemoryDatabase, summarizer: Arc<dyn Summarizer>) -> Self {
        let db = Arc::new(db.with_store_policy(StorePolicy::from_config(&config)));
        let config = Arc::new(config);
        let cache = Arc::new(MemoryCache::new(&config.cache, config.cache_timeout()));
        let conversations = Arc::new(ConversationManager::new(
            Arc::clone(&db),
            Arc::clone(&cache),
            Arc::clone(&config),
        ));
        let knowledge = Arc::new(KnowledgeManager::new(
            Arc::clone(&db),
            Arc::clone(&cache),
            Arc::clone(&config),
        ));
        let engine = Arc::new(ConsolidationEngine::new(
            Arc::clone(&db),
            Arc::clone(&cache),
            Arc::clone(&config),
            summarizer,
        ));
        let sources = Arc::new(ManagerSources::new(Arc::clone(&conversations), Arc::clone(&knowledge)));
        let assembler = ContextAssembler::new(sources, Arc::clone(&config));
        info!("Memory service ready (database {})", config.database_path.display());
        Self {
            config,
            db,
            cache,
            conversations,
            knowledge,
            engine,
            assembler,
        }
    }

    /// Replaces the sources the context assembler reads from.
    pub fn with_context_sources(mut self, sources: Arc<dyn ContextSources>) -> Self {
        self.assembler = ContextAssembler::new(sources, Arc::clone(&self.config));
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeManager> {
        &self.knowledge
    }

    pub fn engine(&self) -> &Arc<ConsolidationEngine> {
        &self.engine
    }

    // Conversations

    pub async fn create_conversation(&self, agent_id: &str, title: &str, metadata: &Metadata) -> MemoryResult<Conversation> {
        observe("create_conversation", self.conversations.create(agent_id, title, metadata).await)
    }

    pub async fn get_conversation(&self, id: &str) -> MemoryResult<Conversation> {
        observe("get_conversation", self.conversations.get(id).await)
    }

    pub async fn list_conversations(
        &self,
        agent_id: &str,
        status: Option<ConversationStatus>,
        limit: usize,
    ) -> MemoryResult<Vec<Conversation>> {
        observe("list_conversations", self.conversations.list(agent_id, status, limit).await)
    }

    pub async fn update_conversation(&self, id: &str, update: ConversationUpdate) -> MemoryResult<Conversation> {
        observe("update_conversation", self.conversations.update(id, update).await)
    }

    pub async fn archive_conversation(&self, id: &str) -> MemoryResult<Conversation> {
        observe("archive_conversation", self.conversations.archive(id).await)
    }

    pub async fn delete_conversation(&self, id: &str) -> MemoryResult<()> {
        observe("delete_conversation", self.conversations.delete(id).await)
    }

    /// Appends a message; past the length bound a consolidation pass is
    /// started in the background and the append still succeeds.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        metadata: &Metadata,
    ) -> MemoryResult<AppendOutcome> {
        let mut outcome = observe(
            "append_message",
            self.conversations
                .append_message(conversation_id, role, content, metadata)
                .await,
        )?;
        if outcome.length_exceeded {
            self.schedule_consolidation(conversation_id);
            outcome.consolidation_scheduled = true;
        }
        Ok(outcome)
    }

    fn schedule_consolidation(&self, conversation_id: &str) {
        if self.engine.locks().is_held(conversation_id) {
            debug!("Consolidation of {} already running", conversation_id);
            return;
        }
        let engine = Arc::clone(&self.engine);
        let id = conversation_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.consolidate(&id, ConsolidationTrigger::Threshold).await {
                warn!("Scheduled consolidation of {} failed; the next sweep retries: {}", id, e);
            }
        });
    }

    pub async fn get_message(&self, message_id: i64) -> MemoryResult<Message> {
        observe("get_message", self.conversations.get_message(message_id).await)
    }

    pub async fn annotate_message(&self, message_id: i64, metadata: &Metadata) -> MemoryResult<Message> {
        observe("annotate_message", self.conversations.annotate_message(message_id, metadata).await)
    }

    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before_id: Option<i64>,
    ) -> MemoryResult<Vec<Message>> {
        observe(
            "list_messages",
            self.conversations.list_messages(conversation_id, limit, before_id).await,
        )
    }

    pub async fn list_message_history(
        &self,
        conversation_id: &str,
        limit: usize,
        before_id: Option<i64>,
    ) -> MemoryResult<Vec<Message>> {
        observe(
            "list_message_history",
            self.conversations
                .list_message_history(conversation_id, limit, before_id)
                .await,
        )
    }

    pub async fn list_summaries(&self, conversation_id: &str) -> MemoryResult<Vec<Summary>> {
        observe("list_summaries", self.conversations.list_summaries(conversation_id).await)
    }

    // Knowledge

    pub async fn create_knowledge(&self, new: NewKnowledgeEntry) -> MemoryResult<KnowledgeEntry> {
        observe("create_knowledge", self.knowledge.create(new).await)
    }

    pub async fn get_knowledge(&self, id: &str) -> MemoryResult<KnowledgeEntry> {
        observe("get_knowledge", self.knowledge.get(id).await)
    }

    pub async fn update_knowledge(&self, id: &str, update: KnowledgeUpdate) -> MemoryResult<KnowledgeEntry> {
        observe("update_knowledge", self.knowledge.update(id, update).await)
    }

    pub async fn delete_knowledge(&self, id: &str) -> MemoryResult<()> {
        observe("delete_knowledge", self.knowledge.delete(id).await)
    }

    pub async fn search_knowledge(&self, query: &SearchQuery) -> MemoryResult<Vec<ScoredEntry>> {
        observe("search_knowledge", self.knowledge.search(query).await)
    }

    pub async fn list_categories(&self) -> MemoryResult<Vec<(String, usize)>> {
        observe("list_categories", self.knowledge.list_categories().await)
    }

    // Context and consolidation

    pub async fn get_context(&self, request: &ContextRequest) -> MemoryResult<ContextBundle> {
        observe("get_context", self.assembler.get_context(request).await)
    }

    pub async fn consolidate(&self, conversation_id: &str) -> MemoryResult<ConsolidationOutcome> {
        observe(
            "consolidate",
            self.engine
                .consolidate(conversation_id, ConsolidationTrigger::Explicit)
                .await,
        )
    }

    pub async fn consolidate_range(
        &self,
        conversation_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> MemoryResult<ConsolidationOutcome> {
        observe(
            "consolidate_range",
            self.engine.consolidate_range(conversation_id, start_id, end_id).await,
        )
    }

    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(Arc::clone(&self.db), Arc::clone(&self.engine), Arc::clone(&self.config))
    }

    /// Starts the periodic retention sweep.
    pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        Arc::new(self.sweeper()).spawn(shutdown)
    }

    // Statistics

    pub async fn stats(&self) -> MemoryResult<MemoryStats> {
        let db_stats = observe("stats", self.db.read("stats", |db| db.get_stats()).await)?;
        Ok(MemoryStats {
            conversations: db_stats.total_conversations,
            active_conversations: db_stats.active_conversations,
            messages: db_stats.total_messages,
            live_messages: db_stats.live_messages,
            summaries: db_stats.total_summaries,
            knowledge_items: db_stats.total_knowledge,
            consolidations_completed: self.engine.completed_count(),
            extraction_failures: self.engine.extraction_failure_count(),
            consolidations_in_flight: self.engine.locks().in_flight(),
            cache: self.cache.stats(),
            database_size_bytes: db_stats.database_size_bytes,
        })
    }

    pub async fn health(&self) -> HealthReport {
        let store = self.db.read("ping", |db| db.ping()).await;
        HealthReport {
            store_ok: store.is_ok(),
            store_error: store.err().map(|e| e.to_string()),
            cache_entries: self.cache.entry_count(),
            consolidations_in_flight: self.engine.locks().in_flight(),
        }
    }
}

fn observe<T>(operation: &str, result: MemoryResult<T>) -> MemoryResult<T> {
    match &result {
        Ok(_) => crate::metrics::record_operation(operation, "ok"),
        Err(e) => {
            debug!("{} failed: {}", operation, e);
            crate::metrics::record_operation(operation, e.kind());
        }
    }
    result
}
