//! CELLAR - Custom Error Types
//! Two layers: `EngineError` is raised by the embedded log engine,
//! `StorageError` is the only taxonomy the storage facade exposes.

use std::path::PathBuf;

use thiserror::Error;

/// Custom Result type for the storage facade.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error types raised by an engine implementation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O errors from value-log or key-registry files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (CRC mismatch, torn frame).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Key not found (or not visible) in the transaction snapshot.
    #[error("Key not found")]
    KeyNotFound,

    /// Keys must be non-empty.
    #[error("Key cannot be empty")]
    EmptyKey,

    /// A key read by the transaction was committed by someone else first.
    #[error("Transaction conflict, please retry")]
    Conflict,

    /// Mutation attempted on a read-only database or transaction.
    #[error("Database or transaction is read-only")]
    ReadOnly,

    /// Space reclamation found nothing worth rewriting.
    #[error("Value log space reclamation resulted in no rewrite")]
    NoRewrite,

    /// Request parameters were rejected.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The iterator was created without value prefetching.
    #[error("Value was not loaded for key {0}")]
    ValueNotLoaded(String),

    /// Sealing/unsealing or key registry failure.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// The engine has been closed.
    #[error("Engine is closed")]
    Closed,
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Error types surfaced by the storage facade.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A supplied encryption key does not match the required length.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    /// An atomic callback transaction aborted its own write.
    #[error("operation was canceled")]
    Canceled,

    /// Create refused to overwrite an existing database.
    #[error("database exist: {}", .0.display())]
    DatabaseExist(PathBuf),

    /// Open refused to create a missing database.
    #[error("database not exist: {}", .0.display())]
    DatabaseNotExist(PathBuf),

    /// A required read found no entry.
    #[error("item not exist: {key}")]
    NotFound { key: String },

    /// Wrapped engine failure with operation context.
    #[error("{op} failed{}: {source}", key_suffix(.key))]
    Engine {
        op: &'static str,
        key: Option<String>,
        #[source]
        source: EngineError,
    },

    /// Directory provisioning failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration or argument.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Value encoding/decoding failure in the operation builders.
    #[error("Codec error: {0}")]
    Codec(String),
}

impl StorageError {
    /// Wrap an engine error raised while operating on `key`.
    pub fn engine(op: &'static str, key: &[u8], source: EngineError) -> Self {
        StorageError::Engine {
            op,
            key: Some(display_key(key)),
            source,
        }
    }

    /// Wrap an engine error raised by a store-level operation.
    pub fn engine_op(op: &'static str, source: EngineError) -> Self {
        StorageError::Engine {
            op,
            key: None,
            source,
        }
    }

    pub fn not_found(key: &[u8]) -> Self {
        StorageError::NotFound {
            key: display_key(key),
        }
    }

    /// True when the engine rejected a commit because of a concurrent write.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::Engine {
                source: EngineError::Conflict,
                ..
            }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Codec(err.to_string())
    }
}

/// Render a binary key for diagnostics.
pub fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(k) => format!(" for key '{}'", k),
        None => String::new(),
    }
}
