//! Audit and Rollback Error Types

use thiserror::Error;

use crate::engine::database::DatabaseError;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Entity type not registered: {0}")]
    UnknownEntityType(String),

    #[error("Snapshot serialization failed: {0}")]
    SerializationFailure(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Entity not found: {entity_type} {entity_id}")]
    EntityNotFound {
        entity_type: String,
        entity_id: String,
    },

    #[error("Concurrent modification of {entity_type} {entity_id}: {detail}")]
    ConcurrentModification {
        entity_type: String,
        entity_id: String,
        detail: String,
    },

    #[error("Storage failure: {0}")]
    StorageFailure(#[from] DatabaseError),

    #[error("Snapshot writes require an active transaction")]
    TransactionRequired,

    #[error("Invalid audit log: {0}")]
    InvalidAuditLog(String),

    #[error("Snapshot {snapshot_id} failed integrity check")]
    IntegrityMismatch { snapshot_id: String },
}

impl AuditError {
    pub fn entity_not_found(entity_type: &str, entity_id: &str) -> Self {
        AuditError::EntityNotFound {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    pub fn concurrent_modification(entity_type: &str, entity_id: &str, detail: impl Into<String>) -> Self {
        AuditError::ConcurrentModification {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            detail: detail.into(),
        }
    }

    /// Only a lost optimistic-concurrency race is worth retrying; storage
    /// failures are fatal and any retry belongs to the host's storage client.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AuditError::ConcurrentModification { .. })
    }
}

impl From<rusqlite::Error> for AuditError {
    fn from(e: rusqlite::Error) -> Self {
        AuditError::StorageFailure(DatabaseError::SqliteError(e))
    }
}

impl From<r2d2::Error> for AuditError {
    fn from(e: r2d2::Error) -> Self {
        AuditError::StorageFailure(DatabaseError::PoolError(e))
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::SerializationFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_concurrency_errors_retry() {
        assert!(AuditError::concurrent_modification("Post", "1", "stale").is_retriable());
        assert!(!AuditError::entity_not_found("Post", "1").is_retriable());
        let storage: AuditError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(storage, AuditError::StorageFailure(_)));
        assert!(!storage.is_retriable());
    }

    #[test]
    fn test_messages_name_the_entity() {
        let err = AuditError::entity_not_found("Post", "999");
        assert_eq!(err.to_string(), "Entity not found: Post 999");
    }
}
