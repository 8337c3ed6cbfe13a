//! Memory database module - SQLite storage for conversations, messages, summaries and knowledge
pub mod conversation_store;
pub mod knowledge_store;
pub mod migration;
pub mod schema;
pub mod summary_store;

pub use conversation_store::{AppendedMessage, ConversationStore};
pub use knowledge_store::KnowledgeStore;
pub use migration::MigrationManager;
pub use schema::*;
pub use summary_store::SummaryStore;

use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use rusqlite::TransactionBehavior;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;

/// Deadline and retry settings applied to every store call.
#[derive(Debug, Clone, Copy)]
pub struct StorePolicy {
    pub timeout: Duration,
    pub write_retries: u32,
    pub base_backoff: Duration,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            write_retries: 3,
            base_backoff: Duration::from_millis(25),
        }
    }
}

impl StorePolicy {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            timeout: config.store_timeout(),
            write_retries: config.store_write_retries,
            ..Self::default()
        }
    }

    /// SQLite lock wait, kept well inside the store deadline so contention
    /// surfaces as `StoreBusy` and goes through the retry path.
    pub fn busy_timeout(&self) -> Duration {
        (self.timeout / 4).max(Duration::from_millis(5))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(10));
        let jitter = rand::thread_rng().gen_range(0..=base.max(1));
        Duration::from_millis(exp + jitter)
    }
}

/// Outcome of committing one consolidation block.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed {
        summary: Summary,
        entries: Vec<KnowledgeEntry>,
        messages_marked: usize,
    },
    /// Another summary already covers part of the range; nothing was written.
    AlreadySummarized,
}

pub struct MemoryDatabase {
    pub conversations: ConversationStore,
    pub summaries: SummaryStore,
    pub knowledge: KnowledgeStore,
    pool: DbPool,
    policy: StorePolicy,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path) -> MemoryResult<Self> {
        Self::with_policy(db_path, StorePolicy::default())
    }

    pub fn with_policy(db_path: &Path, policy: StorePolicy) -> MemoryResult<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::Store(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }
        let busy_timeout = policy.busy_timeout();
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
                conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")
            });
        let pool = Pool::builder()
            .max_size(10)
            .connection_timeout(busy_timeout)
            .build(manager)
            .map_err(|e| MemoryError::Store(format!("failed to create connection pool: {}", e)))?;

        Self::from_pool(Arc::new(pool), policy)
    }

    /// Private in-memory database. Every pooled connection would be a separate
    /// database, so the pool holds exactly one.
    pub fn new_in_memory() -> MemoryResult<Self> {
        let policy = StorePolicy::default();
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(policy.busy_timeout())
            .build(manager)
            .map_err(|e| MemoryError::Store(format!("failed to create connection pool: {}", e)))?;

        Self::from_pool(Arc::new(pool), policy)
    }

    fn from_pool(pool: DbPool, policy: StorePolicy) -> MemoryResult<Self> {
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        info!("Memory database initialized successfully");
        Ok(Self {
            conversations: ConversationStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            knowledge: KnowledgeStore::new(Arc::clone(&pool)),
            pool,
            policy,
        })
    }

    pub fn with_store_policy(mut self, policy: StorePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> StorePolicy {
        self.policy
    }

    /// Runs a read on the blocking pool under the store deadline.
    pub async fn read<T, F>(self: &Arc<Self>, op: &'static str, f: F) -> MemoryResult<T>
    where
        F: FnOnce(&MemoryDatabase) -> MemoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || f(&db));
        match tokio::time::timeout(self.policy.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(MemoryError::Task(format!("{}: {}", op, e))),
            Err(_) => {
                warn!("Store read '{}' exceeded {:?}", op, self.policy.timeout);
                Err(MemoryError::StoreTimeout(op.to_string()))
            }
        }
    }

    /// Runs a write, retrying lock contention and deadline overruns with
    /// jittered exponential backoff, then failing `Unavailable`.
    ///
    /// An attempt that overran is never started a second time: the retry
    /// keeps waiting on the same blocking task, whose commit may still land.
    /// Only an attempt that finished with `StoreBusy` (nothing written) runs
    /// again.
    pub async fn write<T, F>(self: &Arc<Self>, op: &'static str, f: F) -> MemoryResult<T>
    where
        F: Fn(&MemoryDatabase) -> MemoryResult<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut handle = self.spawn_attempt(&f);
        let mut attempt = 0u32;
        loop {
            let (reason, finished) = match tokio::time::timeout(self.policy.timeout, &mut handle).await {
                Ok(Ok(Err(MemoryError::StoreBusy(reason)))) => (reason, true),
                Ok(Ok(result)) => return result,
                Ok(Err(e)) => return Err(MemoryError::Task(format!("{}: {}", op, e))),
                Err(_) => (format!("exceeded {:?}", self.policy.timeout), false),
            };
            if attempt >= self.policy.write_retries {
                warn!("Store write '{}' gave up after {} retries: {}", op, attempt, reason);
                return Err(MemoryError::Unavailable(format!("{}: {}", op, reason)));
            }
            let delay = self.policy.backoff(attempt);
            debug!("Store write '{}' retrying in {:?}: {}", op, delay, reason);
            tokio::time::sleep(delay).await;
            attempt += 1;
            if finished {
                handle = self.spawn_attempt(&f);
            }
        }
    }

    fn spawn_attempt<T, F>(self: &Arc<Self>, f: &Arc<F>) -> JoinHandle<MemoryResult<T>>
    where
        F: Fn(&MemoryDatabase) -> MemoryResult<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(self);
        let call = Arc::clone(f);
        tokio::task::spawn_blocking(move || call(&db))
    }

    /// Writes a summary, its extracted knowledge and the summarized flags in
    /// one transaction. Entries beyond the knowledge limit are dropped.
    pub fn commit_consolidation(
        &self,
        mut summary: Summary,
        mut entries: Vec<KnowledgeEntry>,
        knowledge_limit: usize,
    ) -> MemoryResult<CommitOutcome> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if ConversationStore::get_with_conn(&tx, &summary.conversation_id)?.is_none() {
            return Err(MemoryError::not_found("conversation", summary.conversation_id.clone()));
        }
        if SummaryStore::overlapping_count_with_conn(
            &tx,
            &summary.conversation_id,
            summary.start_message_id,
            summary.end_message_id,
        )? > 0
        {
            debug!(
                "Range {}..={} of {} already summarized",
                summary.start_message_id, summary.end_message_id, summary.conversation_id
            );
            return Ok(CommitOutcome::AlreadySummarized);
        }

        let capacity = knowledge_limit.saturating_sub(KnowledgeStore::count_with_conn(&tx)?);
        if entries.len() > capacity {
            warn!(
                "Knowledge base near limit; keeping {} of {} extracted entries",
                capacity,
                entries.len()
            );
            entries.truncate(capacity);
        }
        for entry in &entries {
            KnowledgeStore::insert_with_conn(&tx, entry)?;
        }

        summary.knowledge_entry_ids = entries.iter().map(|e| e.id.clone()).collect();
        SummaryStore::insert_with_conn(&tx, &summary)?;
        let messages_marked = ConversationStore::mark_summarized_with_conn(
            &tx,
            &summary.conversation_id,
            summary.start_message_id,
            summary.end_message_id,
        )?;
        tx.commit()?;

        info!(
            "Committed summary {} for {} (messages {}..={}, {} knowledge entries)",
            summary.id,
            summary.conversation_id,
            summary.start_message_id,
            summary.end_message_id,
            entries.len()
        );
        Ok(CommitOutcome::Committed {
            summary,
            entries,
            messages_marked,
        })
    }

    pub fn get_stats(&self) -> MemoryResult<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    pub fn ping(&self) -> MemoryResult<()> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Some(conn) = self.pool.try_get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn summary_for(conversation_id: &str, start: i64, end: i64) -> Summary {
        Summary {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            start_message_id: start,
            end_message_id: end,
            message_count: end - start + 1,
            text: "summary".into(),
            knowledge_entry_ids: vec![],
            compression_ratio: 0.5,
            created_at: now(),
        }
    }

    fn seeded(db: &MemoryDatabase, n: usize) -> (Conversation, Vec<Message>) {
        let conv = db.conversations.create("agent-1", "test", &Metadata::new()).unwrap();
        let messages = (0..n)
            .map(|i| {
                db.conversations
                    .append_message(&conv.id, Role::User, &format!("message {}", i), &Metadata::new())
                    .unwrap()
                    .unwrap()
                    .message
            })
            .collect();
        (conv, messages)
    }

    #[test]
    fn test_commit_consolidation_marks_range() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let (conv, messages) = seeded(&db, 5);
        let entry = KnowledgeStore::build_entry(&NewKnowledgeEntry {
            category: "facts".into(),
            title: "Fact".into(),
            content: "content".into(),
            ..Default::default()
        });

        let outcome = db
            .commit_consolidation(summary_for(&conv.id, messages[0].id, messages[2].id), vec![entry.clone()], 10)
            .unwrap();
        match outcome {
            CommitOutcome::Committed { summary, messages_marked, .. } => {
                assert_eq!(messages_marked, 3);
                assert_eq!(summary.knowledge_entry_ids, vec![entry.id.clone()]);
            }
            CommitOutcome::AlreadySummarized => panic!("expected commit"),
        }
        assert_eq!(db.conversations.live_message_count(&conv.id).unwrap(), 2);
        assert!(db.knowledge.get(&entry.id).unwrap().is_some());

        let again = db
            .commit_consolidation(summary_for(&conv.id, messages[2].id, messages[4].id), vec![], 10)
            .unwrap();
        assert!(matches!(again, CommitOutcome::AlreadySummarized));
        assert_eq!(db.summaries.count(&conv.id).unwrap(), 1);
    }

    #[test]
    fn test_commit_consolidation_is_all_or_nothing() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let (conv, messages) = seeded(&db, 3);
        let entry = KnowledgeStore::build_entry(&NewKnowledgeEntry {
            category: "facts".into(),
            title: "Dup".into(),
            content: "content".into(),
            ..Default::default()
        });

        // The second insert violates the primary key and aborts the block.
        let result = db.commit_consolidation(
            summary_for(&conv.id, messages[0].id, messages[2].id),
            vec![entry.clone(), entry],
            10,
        );
        assert!(result.is_err());
        assert_eq!(db.summaries.count(&conv.id).unwrap(), 0);
        assert_eq!(db.knowledge.count().unwrap(), 0);
        assert_eq!(db.conversations.live_message_count(&conv.id).unwrap(), 3);
    }

    #[test]
    fn test_commit_consolidation_respects_knowledge_limit() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let (conv, messages) = seeded(&db, 2);
        let entries = (0..3)
            .map(|i| {
                KnowledgeStore::build_entry(&NewKnowledgeEntry {
                    category: "facts".into(),
                    title: format!("Fact {}", i),
                    content: "content".into(),
                    ..Default::default()
                })
            })
            .collect();
        db.commit_consolidation(summary_for(&conv.id, messages[0].id, messages[1].id), entries, 2)
            .unwrap();
        assert_eq!(db.knowledge.count().unwrap(), 2);
    }

    #[test]
    fn test_commit_for_missing_conversation() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let err = db
            .commit_consolidation(summary_for("missing", 1, 2), vec![], 10)
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_write_retries_busy_then_gives_up() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap().with_store_policy(StorePolicy {
            timeout: Duration::from_secs(1),
            write_retries: 2,
            base_backoff: Duration::from_millis(1),
        }));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: MemoryResult<()> = db
            .write("always_busy", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MemoryError::StoreBusy("locked".into()))
            })
            .await;
        assert!(matches!(result, Err(MemoryError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_write_recovers_after_transient_busy() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap().with_store_policy(StorePolicy {
            timeout: Duration::from_secs(1),
            write_retries: 3,
            base_backoff: Duration::from_millis(1),
        }));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let value = db
            .write("flaky", move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(MemoryError::StoreBusy("locked".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_write_overrun_retried_then_unavailable() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap().with_store_policy(StorePolicy {
            timeout: Duration::from_millis(20),
            write_retries: 2,
            base_backoff: Duration::from_millis(1),
        }));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: MemoryResult<()> = db
            .write("slow_write", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(MemoryError::Unavailable(_))));
        // The overrunning attempt is waited on, never started twice.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_overrun_recovers_without_duplicate() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap().with_store_policy(StorePolicy {
            timeout: Duration::from_millis(20),
            write_retries: 5,
            base_backoff: Duration::from_millis(1),
        }));
        let conv = db.conversations.create("agent-1", "slow", &Metadata::new()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let id = conv.id.clone();
        let appended = db
            .write("append_message", move |db| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(45));
                db.conversations.append_message(&id, Role::User, "late", &Metadata::new())
            })
            .await
            .unwrap();
        assert!(appended.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(db.conversations.live_message_count(&conv.id).unwrap(), 1);
    }

    #[test]
    fn test_busy_timeout_inside_store_deadline() {
        let policy = StorePolicy::default();
        assert!(policy.busy_timeout() < policy.timeout);
    }

    #[tokio::test]
    async fn test_read_deadline_maps_to_store_timeout() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap().with_store_policy(StorePolicy {
            timeout: Duration::from_millis(20),
            write_retries: 0,
            base_backoff: Duration::from_millis(1),
        }));
        let result: MemoryResult<()> = db
            .read("slow", |_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(MemoryError::StoreTimeout(_))));
    }
}
