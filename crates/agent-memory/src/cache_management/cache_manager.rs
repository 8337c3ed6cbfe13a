//! Entity caches in front of the memory store
//!
//! Every key carries a generation number. Writers bump the generation of what
//! they touched before returning, so a read that started before the write can
//! only ever populate a key nobody will look up again. Generations come from
//! one clock, so an id whose entry was forgotten after a delete falls back to
//! a floor above anything a stale reader could hold.
use crate::cache_management::cache_config::CacheConfig;
use crate::cache_management::entity_cache::{CacheStats, CacheStatsSnapshot, EntityCache};
use crate::memory_db::{Conversation, KnowledgeEntry, Message, Summary};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopedKey {
    pub id: String,
    pub generation: u64,
}

/// One page of live messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub conversation_id: String,
    pub generation: u64,
    pub limit: usize,
    pub before_id: Option<i64>,
}

/// A category/tag scan of the knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanKey {
    pub category: Option<String>,
    pub tags: BTreeSet<String>,
    pub generation: u64,
}

pub struct MemoryCache {
    pub conversations: EntityCache<ScopedKey, Conversation>,
    pub message_pages: EntityCache<PageKey, Vec<Message>>,
    pub summaries: EntityCache<ScopedKey, Vec<Summary>>,
    pub knowledge: EntityCache<ScopedKey, KnowledgeEntry>,
    pub knowledge_scans: EntityCache<ScanKey, Vec<KnowledgeEntry>>,
    conversation_generations: DashMap<String, u64>,
    knowledge_generations: DashMap<String, u64>,
    generation_clock: AtomicU64,
    conversation_floor: AtomicU64,
    knowledge_floor: AtomicU64,
    scan_generation: AtomicU64,
    stats: Arc<CacheStats>,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig, timeout: Duration) -> Self {
        let stats = Arc::new(CacheStats::default());
        let ttl = config.ttl();
        let attempts = config.invalidation_attempts;
        let enabled = config.enabled;
        Self {
            conversations: EntityCache::new(
                "conversation",
                config.max_conversations,
                ttl,
                enabled,
                timeout,
                attempts,
                Arc::clone(&stats),
            ),
            message_pages: EntityCache::new(
                "message_page",
                config.max_message_pages,
                ttl,
                enabled,
                timeout,
                attempts,
                Arc::clone(&stats),
            ),
            summaries: EntityCache::new(
                "summary",
                config.max_summary_sets,
                ttl,
                enabled,
                timeout,
                attempts,
                Arc::clone(&stats),
            ),
            knowledge: EntityCache::new(
                "knowledge",
                config.max_knowledge_entries,
                ttl,
                enabled,
                timeout,
                attempts,
                Arc::clone(&stats),
            ),
            knowledge_scans: EntityCache::new(
                "knowledge_scan",
                config.max_knowledge_scans,
                ttl,
                enabled,
                timeout,
                attempts,
                Arc::clone(&stats),
            ),
            conversation_generations: DashMap::new(),
            knowledge_generations: DashMap::new(),
            generation_clock: AtomicU64::new(0),
            conversation_floor: AtomicU64::new(0),
            knowledge_floor: AtomicU64::new(0),
            scan_generation: AtomicU64::new(0),
            stats,
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation_clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn conversation_generation(&self, conversation_id: &str) -> u64 {
        self.conversation_generations
            .get(conversation_id)
            .map(|g| *g)
            .unwrap_or_else(|| self.conversation_floor.load(Ordering::SeqCst))
    }

    fn knowledge_generation(&self, entry_id: &str) -> u64 {
        self.knowledge_generations
            .get(entry_id)
            .map(|g| *g)
            .unwrap_or_else(|| self.knowledge_floor.load(Ordering::SeqCst))
    }

    pub fn conversation_key(&self, conversation_id: &str) -> ScopedKey {
        ScopedKey {
            id: conversation_id.to_string(),
            generation: self.conversation_generation(conversation_id),
        }
    }

    pub fn page_key(&self, conversation_id: &str, limit: usize, before_id: Option<i64>) -> PageKey {
        PageKey {
            conversation_id: conversation_id.to_string(),
            generation: self.conversation_generation(conversation_id),
            limit,
            before_id,
        }
    }

    pub fn knowledge_key(&self, entry_id: &str) -> ScopedKey {
        ScopedKey {
            id: entry_id.to_string(),
            generation: self.knowledge_generation(entry_id),
        }
    }

    pub fn scan_key(&self, category: Option<&str>, tags: &BTreeSet<String>) -> ScanKey {
        ScanKey {
            category: category.map(str::to_string),
            tags: tags.clone(),
            generation: self.scan_generation.load(Ordering::SeqCst),
        }
    }

    /// Drops everything cached for a conversation: the record, its message
    /// pages and its summaries.
    pub async fn invalidate_conversation(&self, conversation_id: &str) {
        let (previous, current) = {
            let mut generation = self
                .conversation_generations
                .entry(conversation_id.to_string())
                .or_insert_with(|| self.conversation_floor.load(Ordering::SeqCst));
            let previous = *generation;
            *generation = self.next_generation();
            (previous, *generation)
        };
        let stale = ScopedKey {
            id: conversation_id.to_string(),
            generation: previous,
        };
        self.conversations.invalidate(&stale).await;
        self.summaries.invalidate(&stale).await;
        debug!("Invalidated cache for conversation {} (generation {})", conversation_id, current);
    }

    /// Drops a knowledge entry and every cached scan.
    pub async fn invalidate_knowledge(&self, entry_id: &str) {
        let previous = {
            let mut generation = self
                .knowledge_generations
                .entry(entry_id.to_string())
                .or_insert_with(|| self.knowledge_floor.load(Ordering::SeqCst));
            let previous = *generation;
            *generation = self.next_generation();
            previous
        };
        self.scan_generation.fetch_add(1, Ordering::SeqCst);
        let stale = ScopedKey {
            id: entry_id.to_string(),
            generation: previous,
        };
        self.knowledge.invalidate(&stale).await;
        debug!("Invalidated cache for knowledge entry {}", entry_id);
    }

    /// Invalidates a deleted conversation and stops tracking its generation.
    /// Raising the floor first keeps keys captured before the delete stale.
    pub async fn forget_conversation(&self, conversation_id: &str) {
        self.invalidate_conversation(conversation_id).await;
        let floor = self.next_generation();
        self.conversation_floor.fetch_max(floor, Ordering::SeqCst);
        self.conversation_generations.remove(conversation_id);
    }

    /// Invalidates a deleted knowledge entry and stops tracking its generation.
    pub async fn forget_knowledge(&self, entry_id: &str) {
        self.invalidate_knowledge(entry_id).await;
        let floor = self.next_generation();
        self.knowledge_floor.fetch_max(floor, Ordering::SeqCst);
        self.knowledge_generations.remove(entry_id);
    }

    /// New entries only affect scans.
    pub fn invalidate_knowledge_scans(&self) {
        self.scan_generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn entry_count(&self) -> u64 {
        self.conversations.entry_count()
            + self.message_pages.entry_count()
            + self.summaries.entry_count()
            + self.knowledge.entry_count()
            + self.knowledge_scans.entry_count()
    }
}
