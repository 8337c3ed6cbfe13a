// crates/agent-memory/src/config.rs

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache_management::CacheConfig;
use crate::error::{MemoryError, MemoryResult};

/// Weights of the lexical knowledge ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchWeights {
    /// Query phrase found in the entry title.
    pub title_phrase: f32,
    /// Fraction of query tokens present in the entry content.
    pub content_overlap: f32,
    /// Fraction of query tokens matching entry tags.
    pub tag_match: f32,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            title_phrase: 3.0,
            content_overlap: 1.0,
            tag_match: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub database_path: PathBuf,
    pub max_conversation_length: usize,
    pub memory_retention_days: u32,
    pub context_window_size: usize,
    pub context_budget_bytes: usize,
    pub knowledge_base_limit: usize,
    pub context_knowledge_candidates: usize,
    pub consolidation_block_size: usize,
    pub sweep_interval_seconds: u64,
    pub store_timeout_ms: u64,
    pub store_write_retries: u32,
    pub cache_timeout_ms: u64,
    pub context_soft_timeout_ms: u64,
    pub summarizer_timeout_seconds: u64,
    pub summarizer_backend_url: Option<String>,
    pub max_message_bytes: usize,
    pub search_weights: SearchWeights,
    pub cache: CacheConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/memory.db"),
            max_conversation_length: 1000,
            memory_retention_days: 30,
            context_window_size: 10,
            context_budget_bytes: 32_768,
            knowledge_base_limit: 10_000,
            context_knowledge_candidates: 20,
            consolidation_block_size: 100,
            sweep_interval_seconds: 3600,
            store_timeout_ms: 5_000,
            store_write_retries: 3,
            cache_timeout_ms: 50,
            context_soft_timeout_ms: 500,
            summarizer_timeout_seconds: 120,
            summarizer_backend_url: None,
            max_message_bytes: 65_536,
            search_weights: SearchWeights::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl MemoryConfig {
    pub fn from_env() -> MemoryResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable source, falling back
    /// to defaults for anything the source does not define.
    pub fn from_lookup<F>(lookup: F) -> MemoryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            database_path: parse("MEMORY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            max_conversation_length: parse_or(&parse, "MAX_CONVERSATION_LENGTH", defaults.max_conversation_length)?,
            memory_retention_days: parse_or(&parse, "MEMORY_RETENTION_DAYS", defaults.memory_retention_days)?,
            context_window_size: parse_or(&parse, "CONTEXT_WINDOW_SIZE", defaults.context_window_size)?,
            context_budget_bytes: parse_or(&parse, "CONTEXT_BUDGET_BYTES", defaults.context_budget_bytes)?,
            knowledge_base_limit: parse_or(&parse, "KNOWLEDGE_BASE_LIMIT", defaults.knowledge_base_limit)?,
            context_knowledge_candidates: parse_or(
                &parse,
                "CONTEXT_KNOWLEDGE_CANDIDATES",
                defaults.context_knowledge_candidates,
            )?,
            consolidation_block_size: parse_or(&parse, "CONSOLIDATION_BLOCK_SIZE", defaults.consolidation_block_size)?,
            sweep_interval_seconds: parse_or(&parse, "SWEEP_INTERVAL_SECONDS", defaults.sweep_interval_seconds)?,
            store_timeout_ms: parse_or(&parse, "STORE_TIMEOUT_MS", defaults.store_timeout_ms)?,
            store_write_retries: parse_or(&parse, "STORE_WRITE_RETRIES", defaults.store_write_retries)?,
            cache_timeout_ms: parse_or(&parse, "CACHE_TIMEOUT_MS", defaults.cache_timeout_ms)?,
            context_soft_timeout_ms: parse_or(&parse, "CONTEXT_SOFT_TIMEOUT_MS", defaults.context_soft_timeout_ms)?,
            summarizer_timeout_seconds: parse_or(
                &parse,
                "SUMMARIZER_TIMEOUT_SECONDS",
                defaults.summarizer_timeout_seconds,
            )?,
            summarizer_backend_url: parse("SUMMARIZER_BACKEND_URL"),
            max_message_bytes: parse_or(&parse, "MAX_MESSAGE_BYTES", defaults.max_message_bytes)?,
            search_weights: SearchWeights {
                title_phrase: parse_or(&parse, "SEARCH_TITLE_WEIGHT", defaults.search_weights.title_phrase)?,
                content_overlap: parse_or(&parse, "SEARCH_CONTENT_WEIGHT", defaults.search_weights.content_overlap)?,
                tag_match: parse_or(&parse, "SEARCH_TAG_WEIGHT", defaults.search_weights.tag_match)?,
            },
            cache: CacheConfig {
                ttl_seconds: parse_or(&parse, "CACHE_TTL_SECONDS", defaults.cache.ttl_seconds)?,
                enabled: parse_or(&parse, "CACHE_ENABLED", defaults.cache.enabled)?,
                ..defaults.cache
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MemoryResult<()> {
        let positive = [
            ("max_conversation_length", self.max_conversation_length as u64),
            ("context_window_size", self.context_window_size as u64),
            ("context_budget_bytes", self.context_budget_bytes as u64),
            ("knowledge_base_limit", self.knowledge_base_limit as u64),
            ("consolidation_block_size", self.consolidation_block_size as u64),
            ("sweep_interval_seconds", self.sweep_interval_seconds),
            ("store_timeout_ms", self.store_timeout_ms),
            ("cache_timeout_ms", self.cache_timeout_ms),
            ("context_soft_timeout_ms", self.context_soft_timeout_ms),
            ("summarizer_timeout_seconds", self.summarizer_timeout_seconds),
            ("max_message_bytes", self.max_message_bytes as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(MemoryError::Config(format!("{} must be greater than zero", name)));
            }
        }
        let weights = &self.search_weights;
        if [weights.title_phrase, weights.content_overlap, weights.tag_match]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(MemoryError::Config("search weights must be finite and non-negative".into()));
        }
        if self.context_window_size > self.max_conversation_length {
            return Err(MemoryError::Config(
                "context_window_size cannot exceed max_conversation_length".into(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn context_soft_timeout(&self) -> Duration {
        Duration::from_millis(self.context_soft_timeout_ms)
    }

    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.summarizer_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.memory_retention_days as i64)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.database_path.display());
        info!("- Max Conversation Length: {}", self.max_conversation_length);
        info!("- Retention: {} days", self.memory_retention_days);
        info!("- Context Window: {} messages / {} bytes", self.context_window_size, self.context_budget_bytes);
        info!("- Knowledge Base Limit: {}", self.knowledge_base_limit);
        info!("- Consolidation Block: {} messages", self.consolidation_block_size);
        info!("- Sweep Interval: {}s", self.sweep_interval_seconds);
        info!("- Store Timeout: {}ms ({} write retries)", self.store_timeout_ms, self.store_write_retries);
        info!("- Cache: enabled={} ttl={}s timeout={}ms", self.cache.enabled, self.cache.ttl_seconds, self.cache_timeout_ms);
        match &self.summarizer_backend_url {
            Some(url) => info!("- Summarizer: LLM backend at {}", url),
            None => info!("- Summarizer: extractive"),
        }
    }
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> MemoryResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| MemoryError::Config(format!("invalid value '{}' for {}: {}", raw, name, e))),
        None => Ok(default),
    }
}
