//! Error types for document processing.

use thiserror::Error;

/// Result type alias for document operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Errors raised while turning a single file into chunks.
///
/// These never concern more than one document; callers log them and move on
/// to the next file.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// No extractor is registered for the file extension.
    #[error("unsupported document type: {0}")]
    UnsupportedType(String),

    /// The document container (docx/pptx) could not be opened.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Office XML could not be parsed.
    #[error("xml error: {0}")]
    Xml(String),

    /// PDF text extraction failed.
    #[error("pdf extraction failed: {0}")]
    Pdf(String),

    /// Markdown frontmatter is not valid YAML.
    #[error("invalid frontmatter: {0}")]
    Frontmatter(String),

    /// Chunking parameters are inconsistent.
    #[error("invalid chunker configuration: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
