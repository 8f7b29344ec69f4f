//! Store Error Taxonomy
//!
//! This module defines the fixed error taxonomy shared by both backend
//! adapters. Every backend-native error condition is mapped onto one of
//! these variants at the adapter boundary, so callers above this layer
//! never inspect driver error types.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the storage layer
///
/// Recoverable conditions (`NotFound`, `DuplicateKey`) are ordinary values
/// for the caller to branch on. Connection-level failures are also values,
/// never panics, so a single downed connection does not crash the process.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No document matched the query
    #[error("no documents found")]
    NotFound,

    /// A unique constraint was violated on either backend
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Identifier text matched neither a 24-character hex id nor a UUID
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Operation attempted on a closed or unreachable connection
    #[error("not connected to database")]
    NotConnected,

    /// Transaction could not be started, committed, or rolled back
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// Operator or capability not supported by the active backend
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Unclassified backend failure, with driver context flattened to text
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an internal error with context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::{ErrorKind, WriteFailure};

        match &*err.kind {
            ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000 => {
                Self::DuplicateKey(we.message.clone())
            }
            ErrorKind::Command(ce) if ce.code == 11000 => Self::DuplicateKey(ce.message.clone()),
            ErrorKind::BulkWrite(bwe) => {
                let dup = bwe
                    .write_errors
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .find(|we| we.code == 11000);
                match dup {
                    Some(we) => Self::DuplicateKey(we.message.clone()),
                    None => Self::Internal(err.to_string()),
                }
            }
            ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) => Self::NotConnected,
            ErrorKind::Transaction { message, .. } => Self::TransactionFailed(message.clone()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => Self::NotConnected,
            sqlx::Error::Database(db) => {
                // 23505 is the SQLSTATE for unique_violation
                if db.code().as_deref() == Some("23505") {
                    Self::DuplicateKey(db.message().to_string())
                } else {
                    Self::Internal(db.message().to_string())
                }
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn sqlx_pool_closed_maps_to_not_connected() {
        let err: StoreError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, StoreError::NotConnected));
    }

    #[test]
    fn error_messages_name_the_condition() {
        assert_eq!(StoreError::NotFound.to_string(), "no documents found");
        assert_eq!(
            StoreError::DuplicateKey("email".into()).to_string(),
            "duplicate key: email"
        );
        assert_eq!(
            StoreError::Unsupported("$where".into()).to_string(),
            "unsupported operation: $where"
        );
    }
}
