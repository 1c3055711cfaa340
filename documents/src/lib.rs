//! # Documents
//!
//! Turns files of a document collection into chunks ready for embedding.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Document Processing                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  path ──► DocumentKind ──► ExtractedDocument ──► ChunkSplitter  │
//! │              │                  │                     │         │
//! │              ▼                  ▼                     ▼         │
//! │     md/txt/docx/pptx/pdf   text + hints         Vec<Chunk>     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod chunker;
pub mod error;
pub mod extract;
pub mod processor;

pub use chunker::{
    Chunk, ChunkMetadata, ChunkSplitter, ChunkerConfig, MetadataValue, StructuralHints,
};
pub use error::{ProcessingError, Result};
pub use extract::{DocumentKind, ExtractedDocument};
pub use processor::DocumentProcessor;
