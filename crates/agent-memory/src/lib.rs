//! Long-lived memory for conversational agents: conversation history,
//! consolidation into summaries and knowledge, and size-bounded context.

pub mod cache_management;
pub mod config;
pub mod consolidation;
pub mod context_engine;
pub mod conversation;
pub mod error;
pub mod knowledge;
pub mod memory_db;
pub mod metrics;
pub mod service;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use config::{MemoryConfig, SearchWeights};
pub use error::{MemoryError, MemoryResult};
pub use service::{HealthReport, MemoryService, MemoryStats};

pub use consolidation::{
    ConsolidationOutcome, ConsolidationReport, ConsolidationTrigger, ExtractedKnowledge, ExtractiveSummarizer,
    LlmSummarizer, Summarizer, SummaryDraft, SweepReport,
};
pub use context_engine::{ContextBundle, ContextRequest, ContextSources, DroppedCounts};
pub use conversation::AppendOutcome;
pub use knowledge::{ScoredEntry, SearchQuery};
pub use memory_db::{
    Conversation, ConversationStatus, ConversationUpdate, KnowledgeEntry, KnowledgeUpdate, MemoryDatabase, Message,
    Metadata, MetadataValue, NewKnowledgeEntry, Role, Summary,
};
