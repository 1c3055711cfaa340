//! File → chunks pipeline.

use std::path::Path;

use tracing::debug;

use crate::chunker::{Chunk, ChunkMetadata, ChunkSplitter, ChunkerConfig};
use crate::error::{ProcessingError, Result};
use crate::extract::DocumentKind;

/// Reads a document, extracts its text and splits it into chunks.
#[derive(Debug, Clone)]
pub struct DocumentProcessor {
    splitter: ChunkSplitter,
}

impl DocumentProcessor {
    /// Create a processor with the given chunking parameters.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        Ok(Self {
            splitter: ChunkSplitter::new(config)?,
        })
    }

    /// The splitter used for every document.
    pub fn splitter(&self) -> &ChunkSplitter {
        &self.splitter
    }

    /// Whether a path has a supported document extension.
    pub fn supports(path: &Path) -> bool {
        DocumentKind::from_path(path).is_some()
    }

    /// Process a file on disk. `source` is recorded as the chunks' `source` metadata.
    pub fn process_file(&self, path: &Path, source: &str) -> Result<Vec<Chunk>> {
        let kind = DocumentKind::from_path(path)
            .ok_or_else(|| ProcessingError::UnsupportedType(path.display().to_string()))?;
        let bytes = std::fs::read(path)?;
        self.process_bytes(kind, &bytes, source)
    }

    /// Process in-memory file contents of a known kind.
    pub fn process_bytes(&self, kind: DocumentKind, bytes: &[u8], source: &str) -> Result<Vec<Chunk>> {
        let document = kind.extract(bytes)?;

        let mut base = ChunkMetadata::new();
        base.insert("source".to_string(), source.into());
        for (key, value) in document.metadata {
            base.entry(key).or_insert(value);
        }

        let chunks = self
            .splitter
            .split_with_metadata(&document.text, &document.hints, &base);
        debug!("Split {source} ({}) into {} chunks", kind.name(), chunks.len());
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::MetadataValue;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn processor() -> DocumentProcessor {
        DocumentProcessor::new(ChunkerConfig {
            max_chunk_size: 200,
            overlap: 20,
            preserve_structure: true,
        })
        .unwrap()
    }

    #[test]
    fn test_process_markdown_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("guide.md");
        std::fs::write(
            &path,
            "---\nauthor: Ada\nsource: ignored\n---\n# Setup\n\nInstall the tool.\n",
        )
        .unwrap();

        let chunks = processor().process_file(&path, "guide.md").unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "# Setup");
        assert_eq!(chunks[1].content, "Install the tool.");
        assert_eq!(chunks[1].source(), Some("guide.md"));
        assert_eq!(chunks[1].metadata.get("author"), Some(&MetadataValue::from("Ada")));
        assert_eq!(chunks[1].metadata.get("type"), Some(&MetadataValue::from("markdown")));
    }

    #[test]
    fn test_plain_text_has_no_heading_detection() {
        let chunks = processor()
            .process_bytes(DocumentKind::PlainText, b"# not a heading\nbody", "a.txt")
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "# not a heading body");
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("photo.png");
        std::fs::write(&path, [0u8, 1, 2]).unwrap();

        let result = processor().process_file(&path, "photo.png");
        assert!(matches!(result, Err(ProcessingError::UnsupportedType(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = processor().process_file(Path::new("/nonexistent/file.md"), "file.md");
        assert!(matches!(result, Err(ProcessingError::Io(_))));
    }
}
