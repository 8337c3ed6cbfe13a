//! Consolidation Engine: summaries, knowledge extraction and the retention sweep

pub mod engine;
pub mod lock;
pub mod summarizer;
pub mod sweeper;

pub use engine::{ConsolidationEngine, ConsolidationOutcome, ConsolidationReport, ConsolidationTrigger};
pub use lock::{ConsolidationGuard, ConsolidationLocks};
pub use summarizer::{ExtractedKnowledge, ExtractiveSummarizer, LlmSummarizer, Summarizer, SummaryDraft};
pub use sweeper::{RetentionSweeper, SweepReport};
