//! Cache layer in front of the persistent store

pub mod cache_config;
pub mod cache_manager;
pub mod entity_cache;

pub use cache_config::CacheConfig;
pub use cache_manager::{MemoryCache, PageKey, ScanKey, ScopedKey};
pub use entity_cache::{CacheStats, CacheStatsSnapshot, EntityCache};
