//! Per-collection vector indices.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use docrag_embeddings::VectorIndex;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;

/// Owns one [`VectorIndex`] per collection, persisted under
/// `<dir>/<collection>/`.
pub struct IndexCatalog {
    dir: Option<PathBuf>,
    model: Option<String>,
    indices: RwLock<HashMap<String, Arc<VectorIndex>>>,
}

impl IndexCatalog {
    /// A catalog whose indices are persisted under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            model: None,
            indices: RwLock::new(HashMap::new()),
        }
    }

    /// A catalog of memory-only indices.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            model: None,
            indices: RwLock::new(HashMap::new()),
        }
    }

    /// Tag every index with the embedding configuration, so persisted
    /// indices built by another configuration are rebuilt instead of loaded.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// The index of `name`, if it is open.
    pub async fn get(&self, name: &str) -> Option<Arc<VectorIndex>> {
        self.indices.read().await.get(name).cloned()
    }

    /// The index of `name`, creating an empty one if needed.
    pub async fn get_or_create(&self, name: &str) -> Arc<VectorIndex> {
        if let Some(index) = self.get(name).await {
            return index;
        }

        let mut indices = self.indices.write().await;
        indices
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Opening index for {name}");
                let index = match &self.dir {
                    Some(dir) => VectorIndex::with_dir(name, dir.join(name)),
                    None => VectorIndex::new(name),
                };
                Arc::new(match &self.model {
                    Some(model) => index.with_model(model),
                    None => index,
                })
            })
            .clone()
    }

    /// Open the index of `name` and load its persisted state.
    ///
    /// Returns the index and whether anything was loaded.
    pub async fn open(&self, name: &str) -> Result<(Arc<VectorIndex>, bool)> {
        let index = self.get_or_create(name).await;
        let loaded = index.load().await?;
        Ok((index, loaded))
    }

    /// The index of `name`, loading its persisted state on first use.
    pub async fn get_or_load(&self, name: &str) -> Result<Arc<VectorIndex>> {
        if let Some(index) = self.get(name).await {
            return Ok(index);
        }
        let (index, _) = self.open(name).await?;
        Ok(index)
    }

    /// Close the index of `name` and delete its persisted state.
    ///
    /// Returns whether the index was open.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let index = self.indices.write().await.remove(name);
        match index {
            Some(index) => {
                index.delete_persisted().await?;
                Ok(true)
            }
            None => {
                // Persisted state may exist for an index that was never opened.
                if let Some(dir) = self.index_dir(name) {
                    VectorIndex::with_dir(name, dir).delete_persisted().await?;
                }
                Ok(false)
            }
        }
    }

    /// Names of open indices, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indices.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn index_dir(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docrag_documents::Chunk;
    use docrag_embeddings::IndexEntry;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn entry(source: &str, text: &str) -> IndexEntry {
        IndexEntry {
            vector: vec![1.0, 0.0],
            chunk: Chunk::new(text, 0, text.chars().count()),
            source_path: source.to_string(),
            fingerprint: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_returns_the_same_index() {
        let catalog = IndexCatalog::in_memory();
        let a = catalog.get_or_create("notes").await;
        let b = catalog.get_or_create("notes").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(catalog.get("other").await.is_none());
        assert_eq!(catalog.names().await, vec!["notes".to_string()]);
    }

    #[tokio::test]
    async fn test_open_loads_persisted_index() {
        let dir = TempDir::new().unwrap();
        {
            let catalog = IndexCatalog::new(dir.path());
            let index = catalog.get_or_create("notes").await;
            index
                .upsert_for_source("a.md", vec![entry("a.md", "alpha")])
                .await
                .unwrap();
            index.persist().await.unwrap();
        }

        let catalog = IndexCatalog::new(dir.path());
        let (index, loaded) = catalog.open("notes").await.unwrap();
        assert!(loaded);
        assert_eq!(index.len(), 1);

        let (_, loaded) = catalog.open("empty").await.unwrap();
        assert!(!loaded);
    }

    #[tokio::test]
    async fn test_remove_deletes_persisted_state() {
        let dir = TempDir::new().unwrap();
        let catalog = IndexCatalog::new(dir.path());
        let index = catalog.get_or_create("notes").await;
        index
            .upsert_for_source("a.md", vec![entry("a.md", "alpha")])
            .await
            .unwrap();
        index.persist().await.unwrap();
        assert!(dir.path().join("notes").exists());

        assert!(catalog.remove("notes").await.unwrap());
        assert!(!dir.path().join("notes").exists());
        assert!(!catalog.remove("notes").await.unwrap());
    }
}
