//! Error types for the storage crate.

use thiserror::Error;

use hearth_core::extension::ExtensionError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL error.
    #[error("Database error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Embedded object database error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Statement touching another schema.
    #[error("Statement not allowed: {0}")]
    Forbidden(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Expired or tampered signed URL.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

// Convert to the extension error seen by extensions and the API
impl From<Error> for ExtensionError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => ExtensionError::Storage(e.to_string()),
            Error::Sql(e) => ExtensionError::Database(e.to_string()),
            Error::Storage(s) | Error::Serialization(s) => ExtensionError::Storage(s),
            Error::Forbidden(s) | Error::InvalidSignature(s) => ExtensionError::PermissionDenied(s),
            Error::InvalidInput(s) => ExtensionError::InvalidInput(s),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(e.to_string())
    }
}
