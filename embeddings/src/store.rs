//! Content-addressed JSON entry store on disk.
//!
//! Entries live at `<dir>/<key[..2]>/<key>.json`. Writes go to a temporary
//! file that is renamed into place, so a reader never sees a partial entry.
//! An unreadable or expired entry behaves as a miss.

use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{EmbeddingError, Result};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A persisted value with its key and creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    /// Key the entry is stored under.
    pub key: String,

    /// Stored value.
    pub value: V,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// On-disk store of [`CacheEntry`] values keyed by hex fingerprints.
#[derive(Debug)]
pub struct CacheStore<V> {
    dir: PathBuf,
    ttl: Option<chrono::Duration>,
    _value: PhantomData<fn() -> V>,
}

impl<V> CacheStore<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>, ttl: Option<chrono::Duration>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            ttl,
            _value: PhantomData,
        })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let shard = key.get(..2).unwrap_or("__");
        self.dir.join(shard).join(format!("{key}.json"))
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        self.ttl
            .is_some_and(|ttl| Utc::now().signed_duration_since(entry.created_at) > ttl)
    }

    /// Read an entry, reporting corruption as an error.
    pub async fn read(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        let bytes = match fs::read(self.entry_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: CacheEntry<V> =
            serde_json::from_slice(&bytes).map_err(|e| EmbeddingError::CacheCorruption {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if entry.key != key {
            return Err(EmbeddingError::CacheCorruption {
                key: key.to_string(),
                reason: format!("entry is stored under key {}", entry.key),
            });
        }

        Ok(Some(entry))
    }

    /// Look up a live value.
    ///
    /// Corrupted entries are logged and deleted, expired entries are
    /// ignored; both count as a miss.
    pub async fn get(&self, key: &str) -> Option<V> {
        match self.read(key).await {
            Ok(Some(entry)) if self.is_expired(&entry) => {
                debug!("Cache entry {key} expired");
                None
            }
            Ok(Some(entry)) => Some(entry.value),
            Ok(None) => None,
            Err(e @ EmbeddingError::CacheCorruption { .. }) => {
                warn!("{e}; discarding entry");
                if let Err(e) = self.remove(key).await {
                    warn!("Failed to remove corrupted cache entry {key}: {e}");
                }
                None
            }
            Err(e) => {
                warn!("Failed to read cache entry {key}: {e}");
                None
            }
        }
    }

    /// Write an entry atomically, replacing any previous value.
    pub async fn put(&self, key: &str, value: V) -> Result<()> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at: Utc::now(),
        };
        let content = serde_json::to_vec(&entry)?;

        let tmp = path.with_extension(format!(
            "json.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete an entry if present.
    pub async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every entry.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}
