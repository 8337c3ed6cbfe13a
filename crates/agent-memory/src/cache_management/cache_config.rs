use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capacities and lifetimes of the entity caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When false every read falls through to the store.
    pub enabled: bool,

    /// Time-to-live applied to every cached entry.
    pub ttl_seconds: u64,

    pub max_conversations: u64,

    /// Cached pages of live messages, across all conversations.
    pub max_message_pages: u64,

    pub max_summary_sets: u64,

    pub max_knowledge_entries: u64,

    /// Cached category/tag scans used as search candidates.
    pub max_knowledge_scans: u64,

    /// Attempts made to invalidate an entry before a write returns.
    pub invalidation_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            max_conversations: 10_000,
            max_message_pages: 5_000,
            max_summary_sets: 5_000,
            max_knowledge_entries: 10_000,
            max_knowledge_scans: 256,
            invalidation_attempts: 3,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}
