//! Fits context tiers into the size budget

use crate::memory_db::{KnowledgeEntry, Message, Summary};
use serde::Serialize;
use tracing::debug;

/// Items left out of a bundle because of the budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DroppedCounts {
    pub messages: usize,
    pub summaries: usize,
    pub knowledge: usize,
}

impl DroppedCounts {
    pub fn total(&self) -> usize {
        self.messages + self.summaries + self.knowledge
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuiltContext {
    pub messages: Vec<Message>,
    pub summaries: Vec<Summary>,
    pub knowledge: Vec<KnowledgeEntry>,
    pub total_size: usize,
    pub dropped: DroppedCounts,
}

/// Serialized size of one context item.
pub fn item_size<T: Serialize>(item: &T) -> usize {
    serde_json::to_vec(item).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Applies the fixed priority live messages > summaries > knowledge. Items are
/// never cut, only left out.
pub struct ContextBuilder {
    budget: usize,
}

impl ContextBuilder {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    /// `messages` and `summaries` in ascending order, `knowledge` in rank order.
    pub fn build(
        &self,
        messages: Vec<Message>,
        summaries: Vec<Summary>,
        knowledge: Vec<KnowledgeEntry>,
    ) -> BuiltContext {
        let mut used = 0usize;
        let mut dropped = DroppedCounts::default();

        // Newest live messages first; older ones go once the budget is hit.
        let mut kept_messages = take_while_fits(messages.into_iter().rev(), self.budget, &mut used, &mut dropped.messages);
        kept_messages.reverse();

        let mut kept_summaries =
            take_while_fits(summaries.into_iter().rev(), self.budget, &mut used, &mut dropped.summaries);
        kept_summaries.reverse();

        let kept_knowledge = take_while_fits(knowledge.into_iter(), self.budget, &mut used, &mut dropped.knowledge);

        if dropped.total() > 0 {
            debug!(
                "Context budget {} bytes: dropped {} messages, {} summaries, {} knowledge entries",
                self.budget, dropped.messages, dropped.summaries, dropped.knowledge
            );
        }
        BuiltContext {
            messages: kept_messages,
            summaries: kept_summaries,
            knowledge: kept_knowledge,
            total_size: used,
            dropped,
        }
    }
}

/// Keeps items in iteration order until one does not fit; that item and all
/// after it are counted as dropped.
fn take_while_fits<T, I>(items: I, budget: usize, used: &mut usize, dropped: &mut usize) -> Vec<T>
where
    T: Serialize,
    I: Iterator<Item = T>,
{
    let mut kept = Vec::new();
    let mut full = false;
    for item in items {
        if full {
            *dropped += 1;
            continue;
        }
        let size = item_size(&item);
        match used.checked_add(size) {
            Some(next) if next <= budget => {
                *used = next;
                kept.push(item);
            }
            _ => {
                full = true;
                *dropped += 1;
            }
        }
    }
    kept
}
