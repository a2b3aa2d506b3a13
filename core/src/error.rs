use serde::{Deserialize, Serialize};
use thiserror::Error;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    NOT_INITIALIZED,
    NOT_FOUND,
    VALIDATION,
    INVALID_TRANSITION,
    INTEGRITY_MISMATCH,
    CONFLICT_RETRY_EXCEEDED,
    STORE_UNAVAILABLE,
    OBJECT_STORE_UNAVAILABLE,
    UNAUTHORIZED,
    PERSISTENCE,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no organizational scope bound to session")]
    NotInitialized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("integrity mismatch for {file_id}: recorded {recorded}, stored {actual}")]
    IntegrityMismatch {
        file_id: String,
        recorded: String,
        actual: String,
    },

    #[error("version number conflict on {evidence_id} not resolved after {attempts} attempts")]
    ConflictRetryExceeded { evidence_id: String, attempts: u32 },

    #[error("relational store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("object store unavailable: {0}")]
    ObjectStoreUnavailable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("{primary} (cleanup warning: {warning})")]
    CompensationFailed {
        primary: Box<CoreError>,
        warning: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotInitialized => ErrorKind::NOT_INITIALIZED,
            CoreError::NotFound(_) => ErrorKind::NOT_FOUND,
            CoreError::Validation(_) | CoreError::Json(_) | CoreError::Csv(_) => {
                ErrorKind::VALIDATION
            }
            CoreError::InvalidTransition(_) => ErrorKind::INVALID_TRANSITION,
            CoreError::IntegrityMismatch { .. } => ErrorKind::INTEGRITY_MISMATCH,
            CoreError::ConflictRetryExceeded { .. } => ErrorKind::CONFLICT_RETRY_EXCEEDED,
            CoreError::StoreUnavailable(_) => ErrorKind::STORE_UNAVAILABLE,
            CoreError::ObjectStoreUnavailable(_) => ErrorKind::OBJECT_STORE_UNAVAILABLE,
            CoreError::Unauthorized(_) => ErrorKind::UNAUTHORIZED,
            CoreError::Persistence(_) => ErrorKind::PERSISTENCE,
            CoreError::CompensationFailed { primary, .. } => primary.kind(),
        }
    }

    /// Only infrastructure hiccups are worth a caller-side retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::STORE_UNAVAILABLE | ErrorKind::OBJECT_STORE_UNAVAILABLE
        )
    }

    pub fn cleanup_warning(&self) -> Option<&str> {
        match self {
            CoreError::CompensationFailed { warning, .. } => Some(warning.as_str()),
            _ => None,
        }
    }

    pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
                    && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        )
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::OutOfMemory => CoreError::StoreUnavailable(err.to_string()),
                _ => CoreError::Persistence(err.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound("row".to_string()),
            _ => CoreError::Persistence(err.to_string()),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            CoreError::NotFound(err.to_string())
        } else {
            CoreError::ObjectStoreUnavailable(err.to_string())
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::{CoreError, ErrorKind};

    #[test]
    fn compensation_failure_keeps_primary_kind() {
        let err = CoreError::CompensationFailed {
            primary: Box::new(CoreError::Persistence("insert aborted".to_string())),
            warning: "delete failed".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::PERSISTENCE);
        assert_eq!(err.cleanup_warning(), Some("delete failed"));
        assert!(!err.is_transient());
    }

    #[test]
    fn busy_database_is_transient() {
        let err: CoreError = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        )
        .into();
        assert!(err.is_transient());
    }
}
