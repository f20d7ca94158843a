//! Import pipeline errors

use thiserror::Error;
use uuid::Uuid;

use crate::services::records::RecordAction;

#[derive(Debug, Error)]
pub enum ImportError {
    /// Another job already holds the (user, module) pair
    #[error("module {module} is locked by another import")]
    Locked { module: String, job_id: Option<Uuid> },

    #[error("permission denied: {action} on {module}")]
    PermissionDenied { module: String, action: RecordAction },

    /// Per-row failure, recorded as FAILED without stopping the batch
    #[error("row {row_id}: {message}")]
    RowConversion { row_id: i64, message: String },

    #[error("staged row {row_id} of {module} is no longer pending")]
    RowNotPending { module: String, row_id: i64 },

    #[error("import job {0} not found")]
    JobNotFound(Uuid),

    #[error("import job {0} has unprocessed rows")]
    NotFinished(Uuid),

    #[error("import job {0} was already undone")]
    AlreadyUndone(Uuid),

    /// No current import for the user
    #[error("import was interrupted")]
    Interrupted,

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Failure reported by the record store collaborator
    #[error("record store error: {0}")]
    Collaborator(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImportError {
    pub fn row(row_id: i64, message: impl Into<String>) -> Self {
        ImportError::RowConversion {
            row_id,
            message: message.into(),
        }
    }

    pub fn locked(module: &str, job_id: Option<Uuid>) -> Self {
        ImportError::Locked {
            module: module.to_string(),
            job_id,
        }
    }

    /// Whether the executor records this as a FAILED row and moves on
    pub fn is_row_failure(&self) -> bool {
        matches!(self, ImportError::RowConversion { .. })
    }

    /// Stable code sent back in error responses
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::Locked { .. } => "LOCKED",
            ImportError::PermissionDenied { .. } => "PERMISSION_DENIED",
            ImportError::RowConversion { .. } => "ROW_CONVERSION_FAILED",
            ImportError::RowNotPending { .. } => "ROW_NOT_PENDING",
            ImportError::JobNotFound(_) => "NOT_FOUND",
            ImportError::NotFinished(_) => "IMPORT_NOT_FINISHED",
            ImportError::AlreadyUndone(_) => "ALREADY_UNDONE",
            ImportError::Interrupted => "IMPORT_INTERRUPTED",
            ImportError::InvalidIdentifier(_) | ImportError::InvalidInput(_) => "INVALID_REQUEST",
            ImportError::Collaborator(_) => "RECORD_STORE_ERROR",
            ImportError::Database(_) => "DATABASE_ERROR",
            ImportError::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_row_conversion_is_row_failure() {
        assert!(ImportError::row(3, "bad date").is_row_failure());
        assert!(!ImportError::Collaborator("down".into()).is_row_failure());
        assert!(!ImportError::locked("Contacts", None).is_row_failure());
        assert!(!ImportError::Database(sqlx::Error::RowNotFound).is_row_failure());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ImportError::locked("Contacts", None).code(), "LOCKED");
        assert_eq!(ImportError::Interrupted.code(), "IMPORT_INTERRUPTED");
        assert_eq!(
            ImportError::PermissionDenied {
                module: "Contacts".into(),
                action: RecordAction::Import,
            }
            .code(),
            "PERMISSION_DENIED"
        );
    }

    #[test]
    fn test_row_error_message_names_row() {
        let err = ImportError::row(7, "missing lastname");
        assert_eq!(err.to_string(), "row 7: missing lastname");
    }
}
