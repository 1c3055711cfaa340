//! Error types for the retrieval engine.

use thiserror::Error;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur in the retrieval engine.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Unknown collection.
    #[error("collection not found: {0}")]
    NotFound(String),

    /// A query was made before any collection was registered.
    #[error("no collections configured")]
    NoCollectionsConfigured,

    /// Collection root is missing or not a directory.
    #[error("invalid collection path: {0}")]
    InvalidPath(String),

    /// The generation provider failed.
    #[error("generation error: {0}")]
    Generation(String),

    /// Embedding error.
    #[error("embedding error: {0}")]
    Embedding(#[from] docrag_embeddings::EmbeddingError),

    /// Directory watcher error.
    #[error("watcher error: {0}")]
    Watcher(docrag_directory_watcher::WatcherError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<docrag_directory_watcher::WatcherError> for RetrievalError {
    fn from(err: docrag_directory_watcher::WatcherError) -> Self {
        use docrag_directory_watcher::WatcherError;

        match err {
            WatcherError::NotFound(name) => Self::NotFound(name),
            WatcherError::InvalidPath(path) => Self::InvalidPath(path),
            WatcherError::Embedding(e) => Self::Embedding(e),
            other => Self::Watcher(other),
        }
    }
}

impl From<reqwest::Error> for RetrievalError {
    fn from(err: reqwest::Error) -> Self {
        Self::Generation(err.to_string())
    }
}

impl From<docrag_documents::ProcessingError> for RetrievalError {
    fn from(err: docrag_documents::ProcessingError) -> Self {
        Self::Config(err.to_string())
    }
}
