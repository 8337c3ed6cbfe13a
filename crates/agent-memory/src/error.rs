//! Error taxonomy for the memory subsystem

use thiserror::Error;

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors surfaced by the memory core.
///
/// Soft conditions (a conversation growing past its length bound, a second
/// consolidation request racing the first) are not errors; they travel in the
/// successful results of the operations that detect them.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Referenced entity is absent.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Malformed caller input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A store call exceeded its deadline.
    #[error("store operation '{0}' timed out")]
    StoreTimeout(String),

    /// The store rejected the call because of lock contention or pool exhaustion.
    #[error("store busy: {0}")]
    StoreBusy(String),

    /// Write retries were exhausted.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The summarization collaborator failed or timed out.
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),

    #[error("database error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl MemoryError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        MemoryError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        MemoryError::Validation(message.into())
    }

    /// True for transient failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoryError::StoreTimeout(_) | MemoryError::StoreBusy(_) | MemoryError::Unavailable(_)
        )
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::NotFound { .. } => "not_found",
            MemoryError::Validation(_) => "validation",
            MemoryError::StoreTimeout(_) => "store_timeout",
            MemoryError::StoreBusy(_) => "store_busy",
            MemoryError::Unavailable(_) => "unavailable",
            MemoryError::ExtractionFailure(_) => "extraction_failure",
            MemoryError::Store(_) => "store",
            MemoryError::Serialization(_) => "serialization",
            MemoryError::Config(_) => "config",
            MemoryError::Task(_) => "task",
        }
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                MemoryError::StoreBusy(e.to_string())
            }
            _ => MemoryError::Store(e.to_string()),
        }
    }
}

impl From<r2d2::Error> for MemoryError {
    fn from(e: r2d2::Error) -> Self {
        MemoryError::StoreBusy(format!("failed to get connection from pool: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MemoryError::StoreTimeout("append".into()).is_retryable());
        assert!(MemoryError::StoreBusy("locked".into()).is_retryable());
        assert!(MemoryError::Unavailable("gave up".into()).is_retryable());
        assert!(!MemoryError::not_found("conversation", "abc").is_retryable());
        assert!(!MemoryError::validation("empty title").is_retryable());
        assert!(!MemoryError::ExtractionFailure("model down".into()).is_retryable());
    }

    #[test]
    fn test_not_found_message_names_entity() {
        let err = MemoryError::not_found("knowledge entry", "k-1");
        assert_eq!(err.to_string(), "knowledge entry 'k-1' not found");
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_sqlite_busy_maps_to_store_busy() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(matches!(MemoryError::from(busy), MemoryError::StoreBusy(_)));

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(matches!(MemoryError::from(constraint), MemoryError::Store(_)));
    }
}
