//! Knowledge Manager

pub mod manager;
pub mod scorer;

pub use manager::{KnowledgeManager, SearchQuery};
pub use scorer::{KnowledgeScorer, PreparedQuery, ScoredEntry};
