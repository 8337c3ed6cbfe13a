//! Knowledge base CRUD and search
use crate::cache_management::MemoryCache;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::knowledge::scorer::{KnowledgeScorer, ScoredEntry};
use crate::memory_db::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

const MAX_CATEGORY_LEN: usize = 128;
const MAX_TITLE_LEN: usize = 1024;
const MAX_TAG_LEN: usize = 64;
const MAX_TAGS: usize = 32;
const MAX_QUERY_LEN: usize = 8_192;
const MAX_SEARCH_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Every listed tag must be present on a result.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub limit: usize,
}

pub struct KnowledgeManager {
    db: Arc<MemoryDatabase>,
    cache: Arc<MemoryCache>,
    config: Arc<MemoryConfig>,
    scorer: KnowledgeScorer,
}

impl KnowledgeManager {
    pub fn new(db: Arc<MemoryDatabase>, cache: Arc<MemoryCache>, config: Arc<MemoryConfig>) -> Self {
        let scorer = KnowledgeScorer::new(config.search_weights.clone());
        Self {
            db,
            cache,
            config,
            scorer,
        }
    }

    pub async fn create(&self, new: NewKnowledgeEntry) -> MemoryResult<KnowledgeEntry> {
        let new = self.normalize_new(new)?;
        let limit = self.config.knowledge_base_limit;
        let entry = self
            .db
            .write("create_knowledge", move |db| db.knowledge.create_with_limit(&new, limit))
            .await;
        self.cache.invalidate_knowledge_scans();
        entry
    }

    pub async fn get(&self, id: &str) -> MemoryResult<KnowledgeEntry> {
        let key = self.cache.knowledge_key(id);
        let owned = id.to_string();
        self.cache
            .knowledge
            .read_through(key, || async {
                self.db
                    .read("get_knowledge", move |db| db.knowledge.get(&owned))
                    .await?
                    .ok_or_else(|| MemoryError::not_found("knowledge entry", id))
            })
            .await
    }

    pub async fn update(&self, id: &str, update: KnowledgeUpdate) -> MemoryResult<KnowledgeEntry> {
        let update = self.normalize_update(update)?;
        let owned = id.to_string();
        let result = self
            .db
            .write("update_knowledge", move |db| db.knowledge.update(&owned, &update))
            .await;
        self.cache.invalidate_knowledge(id).await;
        result?.ok_or_else(|| MemoryError::not_found("knowledge entry", id))
    }

    /// Removes an entry. Summaries that list it keep their advisory reference.
    pub async fn delete(&self, id: &str) -> MemoryResult<()> {
        let owned = id.to_string();
        let result = self
            .db
            .write("delete_knowledge", move |db| db.knowledge.delete(&owned))
            .await;
        self.cache.forget_knowledge(id).await;
        if result? {
            Ok(())
        } else {
            Err(MemoryError::not_found("knowledge entry", id))
        }
    }

    /// Ranked lexical search. The category/tag scan is cached; ranking runs
    /// per query.
    pub async fn search(&self, query: &SearchQuery) -> MemoryResult<Vec<ScoredEntry>> {
        if query.query.len() > MAX_QUERY_LEN {
            return Err(MemoryError::validation(format!("query too long (max {} bytes)", MAX_QUERY_LEN)));
        }
        if query.limit == 0 || query.limit > MAX_SEARCH_LIMIT {
            return Err(MemoryError::validation(format!(
                "limit must be between 1 and {}",
                MAX_SEARCH_LIMIT
            )));
        }
        let tags = normalize_tags(&query.tags)?;
        let category = query.category.as_deref().map(str::trim).filter(|c| !c.is_empty());

        let candidates = self.scan(category, &tags).await?;
        let ranked = self.scorer.rank(&query.query, candidates, query.limit);
        debug!("Knowledge search '{}' returned {} entries", query.query, ranked.len());
        Ok(ranked)
    }

    async fn scan(&self, category: Option<&str>, tags: &BTreeSet<String>) -> MemoryResult<Vec<KnowledgeEntry>> {
        let key = self.cache.scan_key(category, tags);
        let category = category.map(str::to_string);
        let tags = tags.clone();
        self.cache
            .knowledge_scans
            .read_through(key, || async {
                self.db
                    .read("scan_knowledge", move |db| db.knowledge.scan(category.as_deref(), &tags))
                    .await
            })
            .await
    }

    pub async fn list_categories(&self) -> MemoryResult<Vec<(String, usize)>> {
        self.db.read("list_categories", |db| db.knowledge.list_categories()).await
    }

    pub async fn count(&self) -> MemoryResult<usize> {
        self.db.read("count_knowledge", |db| db.knowledge.count()).await
    }

    fn normalize_new(&self, mut new: NewKnowledgeEntry) -> MemoryResult<NewKnowledgeEntry> {
        new.category = validate_category(&new.category)?;
        new.title = validate_text("title", &new.title, MAX_TITLE_LEN)?;
        new.content = validate_text("content", &new.content, self.config.max_message_bytes)?;
        new.tags = normalize_tags(&new.tags)?;
        Ok(new)
    }

    fn normalize_update(&self, mut update: KnowledgeUpdate) -> MemoryResult<KnowledgeUpdate> {
        if let Some(category) = &update.category {
            update.category = Some(validate_category(category)?);
        }
        if let Some(title) = &update.title {
            update.title = Some(validate_text("title", title, MAX_TITLE_LEN)?);
        }
        if let Some(content) = &update.content {
            update.content = Some(validate_text("content", content, self.config.max_message_bytes)?);
        }
        if let Some(tags) = &update.tags {
            update.tags = Some(normalize_tags(tags)?);
        }
        Ok(update)
    }
}

fn validate_category(category: &str) -> MemoryResult<String> {
    let category = category.trim();
    if category.is_empty() || category.len() > MAX_CATEGORY_LEN {
        return Err(MemoryError::validation(format!(
            "category must be 1 to {} bytes",
            MAX_CATEGORY_LEN
        )));
    }
    Ok(category.to_string())
}

fn validate_text(what: &str, value: &str, max: usize) -> MemoryResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(MemoryError::validation(format!("{} cannot be empty", what)));
    }
    if value.len() > max {
        return Err(MemoryError::validation(format!("{} exceeds {} bytes", what, max)));
    }
    if value.contains('\0') {
        return Err(MemoryError::validation(format!("{} contains NUL bytes", what)));
    }
    Ok(value.to_string())
}

/// Tags are compared lowercased and trimmed.
pub(crate) fn normalize_tags(tags: &BTreeSet<String>) -> MemoryResult<BTreeSet<String>> {
    if tags.len() > MAX_TAGS {
        return Err(MemoryError::validation(format!("at most {} tags allowed", MAX_TAGS)));
    }
    tags.iter()
        .map(|tag| {
            let tag = tag.trim().to_lowercase();
            if tag.is_empty() || tag.len() > MAX_TAG_LEN {
                Err(MemoryError::validation(format!("tags must be 1 to {} bytes", MAX_TAG_LEN)))
            } else {
                Ok(tag)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager_with(config: MemoryConfig) -> KnowledgeManager {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let cache = Arc::new(MemoryCache::new(&config.cache, Duration::from_millis(50)));
        KnowledgeManager::new(db, cache, Arc::new(config))
    }

    fn new_entry(category: &str, title: &str, content: &str, tags: &[&str]) -> NewKnowledgeEntry {
        NewKnowledgeEntry {
            category: category.into(),
            title: title.into(),
            content: content.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            source_conversation_id: None,
        }
    }

    fn query(text: &str) -> SearchQuery {
        SearchQuery {
            query: text.into(),
            limit: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exact_title_search_returns_entry_first() {
        let manager = manager_with(MemoryConfig::default());
        manager
            .create(new_entry("ops", "Rollback procedure", "How to roll back the rollback procedure", &["rollback"]))
            .await
            .unwrap();
        let target = manager
            .create(new_entry("ops", "Rollback", "Revert the last deploy", &[]))
            .await
            .unwrap();

        let results = manager.search(&query("Rollback")).await.unwrap();
        assert_eq!(results[0].entry.id, target.id);
    }

    #[tokio::test]
    async fn test_search_sees_new_entries_despite_cached_scan() {
        let manager = manager_with(MemoryConfig::default());
        manager.create(new_entry("a", "first", "alpha", &[])).await.unwrap();
        assert_eq!(manager.search(&query("")).await.unwrap().len(), 1);

        manager.create(new_entry("a", "second", "beta", &[])).await.unwrap();
        assert_eq!(manager.search(&query("")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_category_and_tag_filters() {
        let manager = manager_with(MemoryConfig::default());
        manager.create(new_entry("db", "Postgres tuning", "vacuum", &["postgres", "perf"])).await.unwrap();
        manager.create(new_entry("db", "Postgres backups", "wal", &["Postgres"])).await.unwrap();
        manager.create(new_entry("net", "Postgres proxy", "pgbouncer", &["postgres"])).await.unwrap();

        let mut q = query("postgres");
        q.category = Some("db".into());
        assert_eq!(manager.search(&q).await.unwrap().len(), 2);

        q.tags = ["postgres", "PERF"].iter().map(|t| t.to_string()).collect();
        let results = manager.search(&q).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.title, "Postgres tuning");

        let categories = manager.list_categories().await.unwrap();
        assert_eq!(categories, vec![("db".to_string(), 2), ("net".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_update_and_delete_invalidate_cache() {
        let manager = manager_with(MemoryConfig::default());
        let entry = manager.create(new_entry("a", "title", "content", &[])).await.unwrap();
        assert_eq!(manager.get(&entry.id).await.unwrap().title, "title");

        manager
            .update(
                &entry.id,
                KnowledgeUpdate {
                    title: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(manager.get(&entry.id).await.unwrap().title, "renamed");

        manager.delete(&entry.id).await.unwrap();
        assert!(matches!(manager.get(&entry.id).await, Err(MemoryError::NotFound { .. })));
        assert!(matches!(manager.delete(&entry.id).await, Err(MemoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_knowledge_base_limit_enforced() {
        let manager = manager_with(MemoryConfig {
            knowledge_base_limit: 1,
            ..MemoryConfig::default()
        });
        manager.create(new_entry("a", "one", "x", &[])).await.unwrap();
        let err = manager.create(new_entry("a", "two", "y", &[])).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
        assert_eq!(manager.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_entries_rejected() {
        let manager = manager_with(MemoryConfig::default());
        assert!(manager.create(new_entry(" ", "t", "c", &[])).await.is_err());
        assert!(manager.create(new_entry("a", "", "c", &[])).await.is_err());
        assert!(manager.create(new_entry("a", "t", "c", &[" "])).await.is_err());
        assert!(manager.search(&SearchQuery::default()).await.is_err());
    }
}
