#![allow(dead_code)]

use agent_memory::{ExtractiveSummarizer, MemoryConfig, MemoryService, Message, Summarizer, SummaryDraft};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Small bounds so consolidation is reachable with a handful of messages.
pub fn small_config(dir: &TempDir) -> MemoryConfig {
    MemoryConfig {
        database_path: dir.path().join("memory.db"),
        max_conversation_length: 20,
        context_window_size: 5,
        consolidation_block_size: 10,
        ..MemoryConfig::default()
    }
}

pub fn open_service(_dir: &TempDir, config: MemoryConfig, summarizer: Arc<dyn Summarizer>) -> MemoryService {
    let db = agent_memory::MemoryDatabase::new(&config.database_path).unwrap();
    MemoryService::with_parts(config, db, summarizer)
}

pub fn extractive() -> Arc<dyn Summarizer> {
    Arc::new(ExtractiveSummarizer::default())
}

/// Extractive summarizer that waits before answering and counts calls.
pub struct SlowSummarizer {
    pub delay: Duration,
    pub calls: AtomicUsize,
    inner: ExtractiveSummarizer,
}

impl SlowSummarizer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            inner: ExtractiveSummarizer::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for SlowSummarizer {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<SummaryDraft> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.summarize(messages).await
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

/// Always fails, as a broken backend would.
pub struct FailingSummarizer;

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn summarize(&self, _messages: &[Message]) -> anyhow::Result<SummaryDraft> {
        anyhow::bail!("backend unreachable")
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
