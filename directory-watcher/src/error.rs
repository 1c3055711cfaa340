//! Error types for the directory watcher.

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur in the directory watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Unknown collection.
    #[error("collection not found: {0}")]
    NotFound(String),

    /// A collection with this name is already registered.
    #[error("collection already exists: {0}")]
    AlreadyExists(String),

    /// Collection root is missing or not a directory.
    #[error("invalid collection path: {0}")]
    InvalidPath(String),

    /// Collection name cannot be used as a record key.
    #[error("invalid collection name: {0:?}")]
    InvalidName(String),

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A single file could not be extracted or chunked.
    #[error("processing error: {0}")]
    Processing(#[from] docrag_documents::ProcessingError),

    /// Embedding or index failure.
    #[error("embedding error: {0}")]
    Embedding(#[from] docrag_embeddings::EmbeddingError),
}

impl WatcherError {
    /// Whether the error came from the embedding provider.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::Embedding(e) if e.is_provider_failure())
    }
}
