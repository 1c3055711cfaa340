//! Per-collection indexing pipeline.
//!
//! Scan, extract, split, embed, write. Used for full rebuilds and, as a
//! [`ChangeHandler`], for incremental updates driven by the watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use docrag_documents::DocumentProcessor;
use docrag_embeddings::{EmbeddingCache, IndexEntry, RebuildOutcome, VectorIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Collection;
use crate::error::{Result, WatcherError};
use crate::event::FileEventKind;
use crate::registry::CollectionRegistry;
use crate::watcher::ChangeHandler;

/// Result of a full indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    /// Files that were indexed successfully.
    pub processed_count: usize,

    /// Files found by the scan.
    pub total_count: usize,

    /// Chunks in the index afterwards.
    pub chunk_count: usize,
}

/// Indexes the files of one collection into its vector index.
pub struct CollectionIndexer {
    collection: Collection,
    processor: Arc<DocumentProcessor>,
    cache: Arc<EmbeddingCache>,
    index: Arc<VectorIndex>,
    registry: Arc<CollectionRegistry>,
}

impl CollectionIndexer {
    pub fn new(
        collection: Collection,
        processor: Arc<DocumentProcessor>,
        cache: Arc<EmbeddingCache>,
        index: Arc<VectorIndex>,
        registry: Arc<CollectionRegistry>,
    ) -> Self {
        Self {
            collection,
            processor,
            cache,
            index,
            registry,
        }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// All indexable files under the collection root, sorted by path.
    pub fn scan_files(&self) -> Vec<PathBuf> {
        let root = &self.collection.root_path;
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.path() == root.as_path() || !self.collection.should_exclude(entry.path())
            });

        let mut files = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    if self.collection.includes(entry.path()) {
                        files.push(entry.into_path());
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable entry in {}: {e}", self.collection.name),
            }
        }
        files
    }

    /// Extract, split and embed one file.
    pub async fn build_entries(&self, path: &Path) -> Result<Vec<IndexEntry>> {
        let source = self.source_path(path)?;

        let processor = self.processor.clone();
        let file = path.to_path_buf();
        let label = source.clone();
        let chunks = tokio::task::spawn_blocking(move || processor.process_file(&file, &label))
            .await
            .map_err(std::io::Error::from)??;

        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.cache.get_or_compute_batch(&contents).await?;

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry {
                fingerprint: self.cache.fingerprint(&chunk.content),
                vector,
                chunk,
                source_path: source.clone(),
            })
            .collect())
    }

    /// Re-index one file, returning its chunk count.
    pub async fn index_file(&self, path: &Path) -> Result<usize> {
        let source = self.source_path(path)?;
        let entries = self.build_entries(path).await?;
        let count = entries.len();
        self.index.upsert_for_source(&source, entries).await?;
        debug!("Indexed {source} into {} ({count} chunks)", self.collection.name);
        Ok(count)
    }

    /// Remove one file from the index, returning the removed chunk count.
    pub async fn remove_file(&self, path: &Path) -> Result<usize> {
        let source = self.source_path(path)?;
        Ok(self.index.remove_source(&source).await?)
    }

    /// Rebuild the whole index from the files on disk.
    ///
    /// Files that fail to process keep their previous entries. An embedding
    /// provider failure aborts the run and leaves the index unchanged.
    pub async fn reindex_all(&self) -> Result<IndexReport> {
        let ticket = self.index.begin_rebuild();
        let files = self.scan_files();
        let total_count = files.len();
        info!(
            "Indexing {total_count} files of collection {}",
            self.collection.name
        );

        let mut entries = Vec::new();
        let mut processed_count = 0;
        for path in &files {
            match self.build_entries(path).await {
                Ok(file_entries) => {
                    processed_count += 1;
                    entries.extend(file_entries);
                }
                Err(e) if e.is_provider_failure() => return Err(e),
                Err(e) => {
                    warn!("Failed to process {}: {e}", path.display());
                    if let Ok(source) = self.source_path(path) {
                        entries.extend(self.index.entries_for_source(&source));
                    }
                }
            }
        }

        let chunk_count = match self.index.commit_rebuild(ticket, entries).await? {
            RebuildOutcome::Applied { chunk_count, .. } => chunk_count,
            RebuildOutcome::Superseded => self.index.len(),
        };
        self.index.persist().await?;
        self.record_stats(true).await;

        info!(
            "Indexed collection {}: {processed_count}/{total_count} files, {chunk_count} chunks",
            self.collection.name
        );
        Ok(IndexReport {
            processed_count,
            total_count,
            chunk_count,
        })
    }

    fn source_path(&self, path: &Path) -> Result<String> {
        self.collection.relative_path(path).ok_or_else(|| {
            WatcherError::InvalidPath(format!(
                "{} is outside collection {}",
                path.display(),
                self.collection.name
            ))
        })
    }

    async fn record_stats(&self, full: bool) {
        let last_indexed = full.then(Utc::now);
        if let Err(e) = self
            .registry
            .record_index(&self.collection.name, &self.index, last_indexed)
            .await
        {
            debug!(
                "Could not record stats for {}: {e}",
                self.collection.name
            );
        }
    }
}

#[async_trait]
impl ChangeHandler for CollectionIndexer {
    async fn handle_change(&self, path: &Path, kind: FileEventKind) -> Result<()> {
        if kind == FileEventKind::Deleted || !tokio::fs::try_exists(path).await.unwrap_or(false) {
            let removed = self.remove_file(path).await?;
            debug!("Removed {removed} chunks of {}", path.display());
        } else {
            self.index_file(path).await?;
        }

        self.index.persist().await?;
        self.record_stats(false).await;
        Ok(())
    }
}
