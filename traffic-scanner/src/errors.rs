use crate::db::errors::DbError;
use crate::scanner::ScanError;
use thiserror::Error as ThisError;

/// Errors surfaced to whoever drives the command layer (CLI today, a chat bot tomorrow).
#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Talking to the routing service failed
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Storage operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Returns a short message suitable as a reply to the requesting user
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} {id} not found"),
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Scan(scan_err) => match scan_err {
                ScanError::Storage(db_err) => Error::storage_message(db_err),
                _ => "Could not reach the routing service, please try again later".to_string(),
            },
            Error::Database(db_err) => Error::storage_message(db_err),
            Error::Other(_) => "Internal server error".to_string(),
        }
    }

    fn storage_message(err: &DbError) -> String {
        match err {
            DbError::NotFound => "Resource not found".to_string(),
            DbError::CheckViolation { message, .. } => message.clone(),
            DbError::ForeignKeyViolation { .. } => "Route no longer exists".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

/// Type alias for command layer results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages_hide_internals() {
        let err = Error::Other(anyhow::anyhow!("connection reset by peer at 10.0.0.3"));
        assert_eq!(err.user_message(), "Internal server error");

        let err = Error::Scan(ScanError::InvalidResponse {
            reason: "missing data.routes".to_string(),
        });
        assert_eq!(err.user_message(), "Could not reach the routing service, please try again later");

        let err = Error::NotFound {
            resource: "Route".to_string(),
            id: "12".to_string(),
        };
        assert_eq!(err.user_message(), "Route 12 not found");
    }

    #[test]
    fn test_title_violation_is_user_visible() {
        let err = Error::Database(DbError::CheckViolation {
            table: Some("routes".to_string()),
            message: "route title is 51 characters long, the limit is 50".to_string(),
        });
        assert_eq!(err.user_message(), "route title is 51 characters long, the limit is 50");
    }
}
