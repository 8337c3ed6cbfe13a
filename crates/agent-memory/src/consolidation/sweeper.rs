//! Periodic retention sweep
use crate::config::MemoryConfig;
use crate::consolidation::engine::{ConsolidationEngine, ConsolidationOutcome, ConsolidationTrigger};
use crate::error::MemoryResult;
use crate::memory_db::{now, MemoryDatabase};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SWEEP_BATCH: usize = 500;
const SWEEP_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub consolidated: usize,
    pub archived: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct RetentionSweeper {
    db: Arc<MemoryDatabase>,
    engine: Arc<ConsolidationEngine>,
    config: Arc<MemoryConfig>,
}

impl RetentionSweeper {
    pub fn new(db: Arc<MemoryDatabase>, engine: Arc<ConsolidationEngine>, config: Arc<MemoryConfig>) -> Self {
        Self { db, engine, config }
    }

    /// One sweep: idle conversations are consolidated and archived, active
    /// ones past the length bound are brought back under it. A failure on one
    /// conversation does not stop the others.
    pub async fn run_once(&self) -> MemoryResult<SweepReport> {
        let cutoff = now() - self.config.retention();
        let max_live = self.config.max_conversation_length;
        let (stale, over_length) = self
            .db
            .read("sweep_candidates", move |db| {
                Ok((
                    db.conversations.list_stale(&cutoff, SWEEP_BATCH)?,
                    db.conversations.list_over_length(max_live, SWEEP_BATCH)?,
                ))
            })
            .await?;

        let mut seen = HashSet::new();
        let candidates = stale
            .into_iter()
            .map(|c| (c.id, ConsolidationTrigger::RetentionSweep))
            .chain(over_length.into_iter().map(|c| (c.id, ConsolidationTrigger::Threshold)))
            .filter(|(id, _)| seen.insert(id.clone()))
            .collect::<Vec<_>>();

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };
        let mut queue = candidates.into_iter();
        let mut pending = FuturesUnordered::new();
        for (conversation_id, trigger) in queue.by_ref().take(SWEEP_CONCURRENCY) {
            pending.push(self.sweep_one(conversation_id, trigger));
        }
        while let Some((conversation_id, result)) = pending.next().await {
            if let Some((next_id, next_trigger)) = queue.next() {
                pending.push(self.sweep_one(next_id, next_trigger));
            }
            match result {
                Ok(ConsolidationOutcome::Completed(r)) => {
                    if !r.summary_ids.is_empty() {
                        report.consolidated += 1;
                    }
                    if r.archived {
                        report.archived += 1;
                    }
                }
                Ok(other) => {
                    debug!("Sweep skipped {}: {}", conversation_id, other.label());
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!("Sweep failed for {}: {}", conversation_id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Retention sweep: {} candidates, {} consolidated, {} archived, {} failed",
            report.candidates, report.consolidated, report.archived, report.failed
        );
        Ok(report)
    }

    async fn sweep_one(
        &self,
        conversation_id: String,
        trigger: ConsolidationTrigger,
    ) -> (String, MemoryResult<ConsolidationOutcome>) {
        let result = self.engine.consolidate(&conversation_id, trigger).await;
        (conversation_id, result)
    }

    /// Runs `run_once` every `sweep_interval` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Retention sweeper started (every {:?})", self.config.sweep_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!("Retention sweep aborted: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Retention sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
