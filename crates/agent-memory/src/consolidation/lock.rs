//! Advisory per-conversation consolidation lock
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Conversations currently being consolidated. Acquisition never waits.
#[derive(Debug, Default, Clone)]
pub struct ConsolidationLocks {
    held: Arc<DashMap<String, Instant>>,
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct ConsolidationGuard {
    held: Arc<DashMap<String, Instant>>,
    conversation_id: String,
}

impl ConsolidationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when another pass holds the conversation.
    pub fn try_acquire(&self, conversation_id: &str) -> Option<ConsolidationGuard> {
        match self.held.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(ConsolidationGuard {
                    held: Arc::clone(&self.held),
                    conversation_id: conversation_id.to_string(),
                })
            }
        }
    }

    pub fn is_held(&self, conversation_id: &str) -> bool {
        self.held.contains_key(conversation_id)
    }

    pub fn in_flight(&self) -> usize {
        self.held.len()
    }

    /// Age of the oldest held lock.
    pub fn longest_held(&self) -> Option<Duration> {
        self.held.iter().map(|e| e.value().elapsed()).max()
    }
}

impl ConsolidationGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for ConsolidationGuard {
    fn drop(&mut self) {
        self.held.remove(&self.conversation_id);
    }
}
