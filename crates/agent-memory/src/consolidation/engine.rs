//! Consolidation of aged conversation history into summaries and knowledge
use crate::cache_management::MemoryCache;
use crate::config::MemoryConfig;
use crate::consolidation::lock::ConsolidationLocks;
use crate::consolidation::summarizer::{ExtractedKnowledge, Summarizer};
use crate::error::{MemoryError, MemoryResult};
use crate::knowledge::manager::normalize_tags;
use crate::memory_db::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationTrigger {
    /// The live window passed `max_conversation_length`.
    Threshold,
    /// A caller asked for it.
    Explicit,
    /// The periodic sweep found the conversation idle past retention.
    RetentionSweep,
}

impl ConsolidationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationTrigger::Threshold => "threshold",
            ConsolidationTrigger::Explicit => "explicit",
            ConsolidationTrigger::RetentionSweep => "retention_sweep",
        }
    }

    /// (live count to reach, live messages always kept)
    fn targets(&self, config: &MemoryConfig) -> (usize, usize) {
        match self {
            ConsolidationTrigger::Threshold => (config.max_conversation_length, config.context_window_size),
            ConsolidationTrigger::Explicit => (config.context_window_size, config.context_window_size),
            ConsolidationTrigger::RetentionSweep => (0, 0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationReport {
    pub conversation_id: String,
    pub trigger: ConsolidationTrigger,
    pub summary_ids: Vec<String>,
    pub messages_summarized: usize,
    pub knowledge_created: usize,
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    Completed(ConsolidationReport),
    /// Another pass holds the conversation; nothing was done.
    AlreadyInProgress,
    /// The live window is already within bounds.
    NothingToDo,
    /// The requested range overlaps an existing summary.
    AlreadySummarized,
}

impl ConsolidationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ConsolidationOutcome::Completed(_) => "completed",
            ConsolidationOutcome::AlreadyInProgress => "already_in_progress",
            ConsolidationOutcome::NothingToDo => "nothing_to_do",
            ConsolidationOutcome::AlreadySummarized => "already_summarized",
        }
    }
}

pub struct ConsolidationEngine {
    db: Arc<MemoryDatabase>,
    cache: Arc<MemoryCache>,
    config: Arc<MemoryConfig>,
    summarizer: Arc<dyn Summarizer>,
    locks: ConsolidationLocks,
    completed: AtomicU64,
    extraction_failures: AtomicU64,
}

impl ConsolidationEngine {
    pub fn new(
        db: Arc<MemoryDatabase>,
        cache: Arc<MemoryCache>,
        config: Arc<MemoryConfig>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        info!("Consolidation engine using {} summarizer", summarizer.name());
        Self {
            db,
            cache,
            config,
            summarizer,
            locks: ConsolidationLocks::new(),
            completed: AtomicU64::new(0),
            extraction_failures: AtomicU64::new(0),
        }
    }

    pub fn locks(&self) -> &ConsolidationLocks {
        &self.locks
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn extraction_failure_count(&self) -> u64 {
        self.extraction_failures.load(Ordering::Relaxed)
    }

    /// Summarizes the oldest live messages block by block until the trigger's
    /// target is reached. A retention sweep also archives the conversation.
    pub async fn consolidate(
        &self,
        conversation_id: &str,
        trigger: ConsolidationTrigger,
    ) -> MemoryResult<ConsolidationOutcome> {
        let Some(_guard) = self.locks.try_acquire(conversation_id) else {
            debug!("Consolidation of {} already in progress", conversation_id);
            crate::metrics::record_consolidation("already_in_progress");
            return Ok(ConsolidationOutcome::AlreadyInProgress);
        };

        let result = self.run_pass(conversation_id, trigger).await;
        match &result {
            Ok(outcome) => {
                if matches!(outcome, ConsolidationOutcome::Completed(_)) {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
                crate::metrics::record_consolidation(outcome.label());
            }
            Err(e) => {
                warn!("Consolidation of {} ({}) failed: {}", conversation_id, trigger.as_str(), e);
                crate::metrics::record_consolidation("failed");
            }
        }
        result
    }

    async fn run_pass(
        &self,
        conversation_id: &str,
        trigger: ConsolidationTrigger,
    ) -> MemoryResult<ConsolidationOutcome> {
        let conversation = self.load_conversation(conversation_id).await?;
        let (target, floor) = trigger.targets(&self.config);
        let mut report = ConsolidationReport {
            conversation_id: conversation_id.to_string(),
            trigger,
            summary_ids: Vec::new(),
            messages_summarized: 0,
            knowledge_created: 0,
            archived: false,
        };

        loop {
            let id = conversation_id.to_string();
            let live = self
                .db
                .read("live_message_count", move |db| db.conversations.live_message_count(&id))
                .await?;
            if live <= target {
                break;
            }
            let block_len = self.config.consolidation_block_size.min(live - floor.min(live));
            if block_len == 0 {
                break;
            }

            let block = self.next_block(conversation_id, block_len).await?;
            if block.is_empty() {
                break;
            }
            match self.summarize_and_commit(conversation_id, block).await? {
                CommitOutcome::Committed {
                    summary,
                    entries,
                    messages_marked,
                } => {
                    report.summary_ids.push(summary.id);
                    report.messages_summarized += messages_marked;
                    report.knowledge_created += entries.len();
                }
                CommitOutcome::AlreadySummarized => break,
            }
        }

        if trigger == ConsolidationTrigger::RetentionSweep && conversation.status == ConversationStatus::Active {
            let id = conversation_id.to_string();
            let archived = self
                .db
                .write("archive_conversation", move |db| {
                    db.conversations.update(
                        &id,
                        &ConversationUpdate {
                            status: Some(ConversationStatus::Archived),
                            ..Default::default()
                        },
                    )
                })
                .await;
            self.cache.invalidate_conversation(conversation_id).await;
            report.archived = archived?.is_some();
        }

        if report.summary_ids.is_empty() && !report.archived {
            return Ok(ConsolidationOutcome::NothingToDo);
        }
        info!(
            "Consolidated {} ({}): {} summaries, {} messages, {} knowledge entries{}",
            conversation_id,
            trigger.as_str(),
            report.summary_ids.len(),
            report.messages_summarized,
            report.knowledge_created,
            if report.archived { ", archived" } else { "" }
        );
        Ok(ConsolidationOutcome::Completed(report))
    }

    /// Summarizes an explicit inclusive id range. Ranges touching an existing
    /// summary are rejected without calling the summarizer.
    pub async fn consolidate_range(
        &self,
        conversation_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> MemoryResult<ConsolidationOutcome> {
        if start_id > end_id {
            return Err(MemoryError::validation("start_id must not exceed end_id"));
        }
        let Some(_guard) = self.locks.try_acquire(conversation_id) else {
            crate::metrics::record_consolidation("already_in_progress");
            return Ok(ConsolidationOutcome::AlreadyInProgress);
        };
        self.load_conversation(conversation_id).await?;

        let id = conversation_id.to_string();
        let overlapping = self
            .db
            .read("overlapping_summaries", move |db| {
                db.summaries.overlapping_count(&id, start_id, end_id)
            })
            .await?;
        if overlapping > 0 {
            crate::metrics::record_consolidation("already_summarized");
            return Ok(ConsolidationOutcome::AlreadySummarized);
        }

        let id = conversation_id.to_string();
        let block = self
            .db
            .read("messages_in_range", move |db| {
                db.conversations.messages_in_range(&id, start_id, end_id)
            })
            .await?;
        if block.is_empty() {
            return Ok(ConsolidationOutcome::NothingToDo);
        }

        let outcome = match self.summarize_and_commit(conversation_id, block).await {
            Ok(CommitOutcome::Committed {
                summary,
                entries,
                messages_marked,
            }) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                ConsolidationOutcome::Completed(ConsolidationReport {
                    conversation_id: conversation_id.to_string(),
                    trigger: ConsolidationTrigger::Explicit,
                    summary_ids: vec![summary.id],
                    messages_summarized: messages_marked,
                    knowledge_created: entries.len(),
                    archived: false,
                })
            }
            Ok(CommitOutcome::AlreadySummarized) => ConsolidationOutcome::AlreadySummarized,
            Err(e) => {
                crate::metrics::record_consolidation("failed");
                return Err(e);
            }
        };
        crate::metrics::record_consolidation(outcome.label());
        Ok(outcome)
    }

    async fn load_conversation(&self, conversation_id: &str) -> MemoryResult<Conversation> {
        let id = conversation_id.to_string();
        self.db
            .read("get_conversation", move |db| db.conversations.get(&id))
            .await?
            .ok_or_else(|| MemoryError::not_found("conversation", conversation_id))
    }

    /// Oldest live messages, cut before the next existing summary so the
    /// block is contiguous.
    async fn next_block(&self, conversation_id: &str, block_len: usize) -> MemoryResult<Vec<Message>> {
        let id = conversation_id.to_string();
        let (mut block, summaries) = self
            .db
            .read("next_consolidation_block", move |db| {
                Ok((
                    db.conversations.oldest_live_messages(&id, block_len)?,
                    db.summaries.list_for_conversation(&id)?,
                ))
            })
            .await?;
        if let Some(first) = block.first().map(|m| m.id) {
            if let Some(barrier) = summaries
                .iter()
                .map(|s| s.start_message_id)
                .filter(|&start| start > first)
                .min()
            {
                block.retain(|m| m.id < barrier);
            }
        }
        Ok(block)
    }

    async fn summarize_and_commit(
        &self,
        conversation_id: &str,
        block: Vec<Message>,
    ) -> MemoryResult<CommitOutcome> {
        let (Some(first), Some(last)) = (block.first(), block.last()) else {
            return Err(MemoryError::validation("empty consolidation block"));
        };
        let (start_id, end_id) = (first.id, last.id);

        let draft = match tokio::time::timeout(
            self.config.summarizer_timeout(),
            self.summarizer.summarize(&block),
        )
        .await
        {
            Ok(Ok(draft)) => draft,
            Ok(Err(e)) => return Err(self.extraction_failed(conversation_id, e.to_string())),
            Err(_) => {
                return Err(self.extraction_failed(
                    conversation_id,
                    format!("summarizer timed out after {:?}", self.config.summarizer_timeout()),
                ))
            }
        };
        if draft.text.trim().is_empty() {
            return Err(self.extraction_failed(conversation_id, "summarizer returned empty text".into()));
        }

        let covered_bytes: usize = block.iter().map(|m| m.content.len()).sum();
        let summary = Summary {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            start_message_id: start_id,
            end_message_id: end_id,
            message_count: block.len() as i64,
            compression_ratio: draft.text.len() as f32 / covered_bytes.max(1) as f32,
            text: draft.text,
            knowledge_entry_ids: Vec::new(),
            created_at: now(),
        };
        let entries: Vec<KnowledgeEntry> = draft
            .knowledge
            .into_iter()
            .filter_map(|k| to_entry(k, conversation_id))
            .collect();
        let has_entries = !entries.is_empty();
        let limit = self.config.knowledge_base_limit;

        let result = self
            .db
            .write("commit_consolidation", move |db| {
                db.commit_consolidation(summary.clone(), entries.clone(), limit)
            })
            .await;
        self.cache.invalidate_conversation(conversation_id).await;
        if has_entries {
            self.cache.invalidate_knowledge_scans();
        }
        result
    }

    fn extraction_failed(&self, conversation_id: &str, reason: String) -> MemoryError {
        self.extraction_failures.fetch_add(1, Ordering::Relaxed);
        warn!("Extraction failed for {}: {}", conversation_id, reason);
        MemoryError::ExtractionFailure(reason)
    }
}

/// Turns a summarizer proposal into a storable entry, dropping unusable ones.
fn to_entry(extracted: ExtractedKnowledge, conversation_id: &str) -> Option<KnowledgeEntry> {
    let title = extracted.title.trim();
    let content = extracted.content.trim();
    if title.is_empty() || content.is_empty() {
        return None;
    }
    let category = match extracted.category.trim() {
        "" => "facts",
        other => other,
    };
    let tags: BTreeSet<String> = extracted
        .tags
        .into_iter()
        .filter_map(|t| {
            normalize_tags(&BTreeSet::from([t]))
                .ok()
                .and_then(|set| set.into_iter().next())
        })
        .collect();
    Some(crate::memory_db::KnowledgeStore::build_entry(&NewKnowledgeEntry {
        category: category.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        tags,
        source_conversation_id: Some(conversation_id.to_string()),
    }))
}
