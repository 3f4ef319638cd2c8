//! Error types shared across the workspace.
//!
//! `CoreError` covers persistent store failures. `EnqueueError` is the only
//! way a producer learns that a job was not accepted.

use thiserror::Error;

use crate::models::RecipientId;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Store and validation failures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Reasons a job was refused by a [`crate::JobSink`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The outbound channel reported that this recipient blocked us.
    #[error("recipient {recipient} has blocked the channel")]
    RecipientBlocked {
        /// Recipient that refused delivery
        recipient: RecipientId,
    },

    /// The scheduler is shutting down and accepts no more work.
    #[error("job queue is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn other_sqlx_errors_map_to_database() {
        let err = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, CoreError::Database(_)));
    }

    #[test]
    fn enqueue_error_names_recipient() {
        let err = EnqueueError::RecipientBlocked { recipient: RecipientId(42) };
        assert_eq!(err.to_string(), "recipient 42 has blocked the channel");
    }
}
