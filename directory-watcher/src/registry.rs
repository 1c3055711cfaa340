//! Collection registry.
//!
//! Holds every registered [`Collection`] and persists each one as
//! `<dir>/<name>.json`. The registry is the single owner of collection
//! records; watchers and the query side read from it.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use docrag_embeddings::VectorIndex;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Collection;
use crate::error::{Result, WatcherError};

/// Store of collection records.
pub struct CollectionRegistry {
    /// Directory holding one JSON record per collection.
    dir: Option<PathBuf>,

    collections: RwLock<BTreeMap<String, Collection>>,
}

impl CollectionRegistry {
    /// Create a registry that is not persisted.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open the registry stored under `dir`, loading existing records.
    ///
    /// Unreadable records are logged and skipped.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let mut collections = BTreeMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let record = fs::read(&path).await?;
            match serde_json::from_slice::<Collection>(&record) {
                Ok(collection) => {
                    collections.insert(collection.name.clone(), collection);
                }
                Err(e) => warn!("Skipping unreadable collection record {}: {e}", path.display()),
            }
        }

        info!("Loaded {} collections from {}", collections.len(), dir.display());
        Ok(Self {
            dir: Some(dir),
            collections: RwLock::new(collections),
        })
    }

    /// Register a new collection.
    ///
    /// The root must be an existing directory; it is stored canonicalized.
    pub async fn register(&self, mut collection: Collection) -> Result<Collection> {
        validate_name(&collection.name)?;

        let root = &collection.root_path;
        if !fs::metadata(root).await.is_ok_and(|m| m.is_dir()) {
            return Err(WatcherError::InvalidPath(root.display().to_string()));
        }
        collection.root_path = fs::canonicalize(root).await?;

        let mut collections = self.collections.write().await;
        if collections.contains_key(&collection.name) {
            return Err(WatcherError::AlreadyExists(collection.name));
        }

        self.save(&collection).await?;
        collections.insert(collection.name.clone(), collection.clone());

        info!(
            "Registered collection {} at {}",
            collection.name,
            collection.root_path.display()
        );
        Ok(collection)
    }

    /// Get a collection by name.
    pub async fn get(&self, name: &str) -> Result<Collection> {
        self.collections
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| WatcherError::NotFound(name.to_string()))
    }

    /// All collections, ordered by name.
    pub async fn list(&self) -> Vec<Collection> {
        self.collections.read().await.values().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.collections.read().await.is_empty()
    }

    pub async fn enable(&self, name: &str) -> Result<Collection> {
        self.update(name, |c| c.enabled = true).await
    }

    pub async fn disable(&self, name: &str) -> Result<Collection> {
        self.update(name, |c| c.enabled = false).await
    }

    /// Record the chunk count of `index` for collection `name`.
    ///
    /// The count is read while the record is locked, so concurrent writers
    /// always leave the latest count behind.
    pub async fn record_index(
        &self,
        name: &str,
        index: &VectorIndex,
        last_indexed: Option<DateTime<Utc>>,
    ) -> Result<Collection> {
        self.update(name, |c| {
            c.chunk_count = index.len();
            if last_indexed.is_some() {
                c.last_indexed = last_indexed;
            }
        })
        .await
    }

    /// Remove a collection record.
    pub async fn remove(&self, name: &str) -> Result<Collection> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .remove(name)
            .ok_or_else(|| WatcherError::NotFound(name.to_string()))?;

        if let Some(dir) = &self.dir {
            match fs::remove_file(record_path(dir, name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!("Removed collection {name}");
        Ok(collection)
    }

    async fn update(&self, name: &str, apply: impl FnOnce(&mut Collection)) -> Result<Collection> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| WatcherError::NotFound(name.to_string()))?;

        let mut updated = collection.clone();
        apply(&mut updated);
        self.save(&updated).await?;
        *collection = updated.clone();

        debug!("Updated collection {name}");
        Ok(updated)
    }

    async fn save(&self, collection: &Collection) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = record_path(dir, &collection.name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(collection)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn record_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '));

    if valid {
        Ok(())
    } else {
        Err(WatcherError::InvalidName(name.to_string()))
    }
}
