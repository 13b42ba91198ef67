//! Error types for docstore
//!
//! Provides a unified error type hierarchy for the engine and the adapter.

use thiserror::Error;

/// Result type alias using docstore's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for docstore
#[derive(Error, Debug)]
pub enum Error {
    // Storage Errors
    #[error("{0}")]
    Storage(#[from] StorageError),

    // Protocol Errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the document store.
///
/// Messages follow the store's own wording; the adapter forwards them verbatim.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database `{0}` already exists.")]
    DatabaseExists(String),

    #[error("Database `{0}` does not exist.")]
    DatabaseNotFound(String),

    #[error("Table `{db}.{table}` already exists.")]
    TableExists { db: String, table: String },

    #[error("Table `{db}.{table}` does not exist.")]
    TableNotFound { db: String, table: String },

    #[error("{kind} name `{name}` invalid (Use A-Z, a-z, 0-9, _ and - only).")]
    InvalidName { kind: &'static str, name: String },

    #[error("Primary keys must be either a number, string, bool or array (got type {0}).")]
    InvalidPrimaryKey(String),

    #[error("Expected type OBJECT but found {0}.")]
    NotAnObject(String),

    #[error("{0}")]
    InvalidQuery(String),

    #[error("Changefeed lagged, skipped {0} changes.")]
    FeedLagged(u64),

    #[error("Connection is closed.")]
    Closed,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),
}

/// Protocol-related errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// True when the error originates in the document store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}
