//! Conversation Manager

pub mod manager;

pub use manager::{AppendOutcome, ConversationManager};
