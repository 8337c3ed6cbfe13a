//! Knowledge base storage
use crate::error::{MemoryError, MemoryResult};
use crate::memory_db::conversation_store::timestamp_column;
use crate::memory_db::schema::*;
use crate::memory_db::DbPool;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use std::collections::BTreeSet;
use tracing::{debug, info};
use uuid::Uuid;

const KNOWLEDGE_COLUMNS: &str =
    "id, category, title, content, tags, source_conversation_id, created_at, updated_at";

#[derive(Clone)]
pub struct KnowledgeStore {
    pool: DbPool,
}

impl KnowledgeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Builds a fresh entry with a new id and matching timestamps.
    pub fn build_entry(new: &NewKnowledgeEntry) -> KnowledgeEntry {
        let ts = now();
        KnowledgeEntry {
            id: Uuid::new_v4().to_string(),
            category: new.category.clone(),
            title: new.title.clone(),
            content: new.content.clone(),
            tags: new.tags.clone(),
            source_conversation_id: new.source_conversation_id.clone(),
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Inserts an entry unless the base already holds `limit` entries.
    pub fn create_with_limit(&self, new: &NewKnowledgeEntry, limit: usize) -> MemoryResult<KnowledgeEntry> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = Self::count_with_conn(&tx)?;
        if current >= limit {
            return Err(MemoryError::validation(format!(
                "knowledge base is full ({} of {} entries)",
                current, limit
            )));
        }
        let entry = Self::build_entry(new);
        Self::insert_with_conn(&tx, &entry)?;
        tx.commit()?;
        info!("Created knowledge entry {} in category '{}'", entry.id, entry.category);
        Ok(entry)
    }

    pub fn insert_with_conn(conn: &Connection, entry: &KnowledgeEntry) -> MemoryResult<()> {
        conn.execute(
            "INSERT INTO knowledge_entries
             (id, category, title, content, tags, source_conversation_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &entry.id,
                &entry.category,
                &entry.title,
                &entry.content,
                serde_json::to_string(&entry.tags)?,
                entry.source_conversation_id.as_deref(),
                format_timestamp(&entry.created_at),
                format_timestamp(&entry.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> MemoryResult<Option<KnowledgeEntry>> {
        let conn = self.pool.get()?;
        Self::get_with_conn(&conn, id)
    }

    fn get_with_conn(conn: &Connection, id: &str) -> MemoryResult<Option<KnowledgeEntry>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM knowledge_entries WHERE id = ?1",
            KNOWLEDGE_COLUMNS
        ))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_entry(row)?)),
            None => Ok(None),
        }
    }

    pub fn update(&self, id: &str, update: &KnowledgeUpdate) -> MemoryResult<Option<KnowledgeEntry>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut entry) = Self::get_with_conn(&tx, id)? else {
            return Ok(None);
        };
        if let Some(category) = &update.category {
            entry.category = category.clone();
        }
        if let Some(title) = &update.title {
            entry.title = title.clone();
        }
        if let Some(content) = &update.content {
            entry.content = content.clone();
        }
        if let Some(tags) = &update.tags {
            entry.tags = tags.clone();
        }
        entry.updated_at = now();

        tx.execute(
            "UPDATE knowledge_entries
             SET category = ?1, title = ?2, content = ?3, tags = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                &entry.category,
                &entry.title,
                &entry.content,
                serde_json::to_string(&entry.tags)?,
                format_timestamp(&entry.updated_at),
                id,
            ],
        )?;
        tx.commit()?;
        debug!("Updated knowledge entry {}", id);
        Ok(Some(entry))
    }

    pub fn delete(&self, id: &str) -> MemoryResult<bool> {
        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM knowledge_entries WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// Entries in `category` (any when `None`) carrying every tag in `tags`,
    /// most recently updated first.
    pub fn scan(&self, category: Option<&str>, tags: &BTreeSet<String>) -> MemoryResult<Vec<KnowledgeEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM knowledge_entries
             WHERE (?1 IS NULL OR category = ?1)
             ORDER BY updated_at DESC, id ASC",
            KNOWLEDGE_COLUMNS
        ))?;
        let mut rows = stmt.query(params![category])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let entry = row_to_entry(row)?;
            if tags.is_subset(&entry.tags) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn count(&self) -> MemoryResult<usize> {
        let conn = self.pool.get()?;
        Self::count_with_conn(&conn)
    }

    pub fn count_with_conn(conn: &Connection) -> MemoryResult<usize> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM knowledge_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Distinct categories with their entry counts, alphabetical.
    pub fn list_categories(&self) -> MemoryResult<Vec<(String, usize)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) FROM knowledge_entries GROUP BY category ORDER BY category ASC",
        )?;
        let categories = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(categories)
    }
}

fn row_to_entry(row: &Row) -> MemoryResult<KnowledgeEntry> {
    let tags_json: String = row.get(4)?;
    Ok(KnowledgeEntry {
        id: row.get(0)?,
        category: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        tags: serde_json::from_str(&tags_json)?,
        source_conversation_id: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
    })
}
