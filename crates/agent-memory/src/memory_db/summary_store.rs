//! Summary storage
use crate::error::MemoryResult;
use crate::memory_db::conversation_store::timestamp_column;
use crate::memory_db::schema::*;
use crate::memory_db::DbPool;
use rusqlite::{params, Connection, Row};

const SUMMARY_COLUMNS: &str = "id, conversation_id, start_message_id, end_message_id, message_count, \
                               summary_text, knowledge_entry_ids, compression_ratio, created_at";

#[derive(Clone)]
pub struct SummaryStore {
    pool: DbPool,
}

impl SummaryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Summaries of a conversation ordered by the range they cover.
    pub fn list_for_conversation(&self, conversation_id: &str) -> MemoryResult<Vec<Summary>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM summaries WHERE conversation_id = ?1 ORDER BY start_message_id ASC",
            SUMMARY_COLUMNS
        ))?;
        let mut rows = stmt.query([conversation_id])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(row_to_summary(row)?);
        }
        Ok(summaries)
    }

    pub fn count(&self, conversation_id: &str) -> MemoryResult<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM summaries WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn overlapping_count(&self, conversation_id: &str, start_id: i64, end_id: i64) -> MemoryResult<usize> {
        let conn = self.pool.get()?;
        Self::overlapping_count_with_conn(&conn, conversation_id, start_id, end_id)
    }

    pub fn overlapping_count_with_conn(
        conn: &Connection,
        conversation_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> MemoryResult<usize> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM summaries
             WHERE conversation_id = ?1 AND start_message_id <= ?3 AND end_message_id >= ?2",
            params![conversation_id, start_id, end_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn insert_with_conn(conn: &Connection, summary: &Summary) -> MemoryResult<()> {
        conn.execute(
            "INSERT INTO summaries
             (id, conversation_id, start_message_id, end_message_id, message_count,
              summary_text, knowledge_entry_ids, compression_ratio, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &summary.id,
                &summary.conversation_id,
                summary.start_message_id,
                summary.end_message_id,
                summary.message_count,
                &summary.text,
                serde_json::to_string(&summary.knowledge_entry_ids)?,
                summary.compression_ratio as f64,
                format_timestamp(&summary.created_at),
            ],
        )?;
        Ok(())
    }
}

fn row_to_summary(row: &Row) -> MemoryResult<Summary> {
    let entry_ids_json: String = row.get(6)?;
    let compression_ratio: f64 = row.get(7)?;
    Ok(Summary {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        start_message_id: row.get(2)?,
        end_message_id: row.get(3)?,
        message_count: row.get(4)?,
        text: row.get(5)?,
        knowledge_entry_ids: serde_json::from_str(&entry_ids_json)?,
        compression_ratio: compression_ratio as f32,
        created_at: timestamp_column(row, 8)?,
    })
}
