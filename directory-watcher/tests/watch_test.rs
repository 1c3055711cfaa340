//! Watcher-driven incremental indexing against a real directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use docrag_directory_watcher::{
    Collection, CollectionIndexer, CollectionRegistry, DirectoryWatcher, WatchOptions,
};
use docrag_documents::{ChunkerConfig, DocumentProcessor};
use docrag_embeddings::{EmbeddingCache, HashingProvider, VectorIndex};
use tempfile::TempDir;

/// Poll until `check` holds or the deadline passes.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    check()
}

async fn indexer(docs: &Path, state: &Path) -> Arc<CollectionIndexer> {
    let registry = Arc::new(CollectionRegistry::open(state.join("collections")).await.unwrap());
    let collection = registry
        .register(Collection::new("notes", docs))
        .await
        .unwrap();

    let cache = EmbeddingCache::new(Arc::new(HashingProvider::new(64)), 1000);
    Arc::new(CollectionIndexer::new(
        collection,
        Arc::new(DocumentProcessor::new(ChunkerConfig::default()).unwrap()),
        Arc::new(cache),
        Arc::new(VectorIndex::with_dir("notes", state.join("indices/notes"))),
        registry,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_file_disappears_after_debounce() {
    let docs = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    std::fs::write(docs.path().join("keep.md"), "# Keep\n\nstays indexed").unwrap();
    std::fs::write(docs.path().join("gone.md"), "# Gone\n\nwill be deleted").unwrap();

    let indexer = indexer(docs.path(), state.path()).await;
    indexer.reindex_all().await.unwrap();
    assert!(!indexer.index().entries_for_source("gone.md").is_empty());

    let watcher = DirectoryWatcher::new(WatchOptions {
        debounce: Duration::from_millis(200),
        channel_capacity: 64,
    });
    watcher
        .watch(indexer.collection(), indexer.clone())
        .await
        .unwrap();

    std::fs::remove_file(docs.path().join("gone.md")).unwrap();
    let index = indexer.index().clone();
    assert!(eventually(|| index.entries_for_source("gone.md").is_empty()).await);
    assert!(!index.entries_for_source("keep.md").is_empty());

    std::fs::write(docs.path().join("new.md"), "fresh note about gardening").unwrap();
    assert!(eventually(|| !index.entries_for_source("new.md").is_empty()).await);

    watcher.stop_all().await;

    // The incremental updates were persisted.
    let reloaded = VectorIndex::with_dir("notes", state.path().join("indices/notes"));
    assert!(reloaded.load().await.unwrap());
    assert_eq!(reloaded.sources(), index.sources());
}
