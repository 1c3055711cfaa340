//! Fingerprint-keyed embedding cache.
//!
//! The fingerprint of a chunk covers the model identity, its parameters and
//! the chunk content, so a vector is only ever reused for the exact
//! configuration that produced it. Hits are served from a bounded in-memory
//! map first and from the on-disk [`CacheStore`] second.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{EmbeddingError, Result};
use crate::provider::EmbeddingProvider;
use crate::similarity::normalize;
use crate::store::CacheStore;
use crate::{Embedding, fingerprint};

#[derive(Debug, Clone)]
struct MemoryEntry {
    embedding: Embedding,
    sequence: u64,
}

/// Bounded in-memory tier with insertion-order eviction.
///
/// `order` may hold stale `(sequence, key)` pairs for keys that were
/// re-inserted or removed; a pair only counts while its sequence matches
/// the live entry.
#[derive(Debug, Default)]
struct MemoryTier {
    entries: HashMap<String, MemoryEntry>,
    order: VecDeque<(u64, String)>,
}

impl MemoryTier {
    fn get(&self, key: &str) -> Option<&Embedding> {
        self.entries.get(key).map(|e| &e.embedding)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn insert(&mut self, key: &str, embedding: Embedding, sequence: u64, capacity: usize) {
        if !self.entries.contains_key(key) {
            while self.entries.len() >= capacity {
                let Some((oldest, oldest_key)) = self.order.pop_front() else {
                    break;
                };
                if self.entries.get(&oldest_key).is_some_and(|e| e.sequence == oldest) {
                    self.entries.remove(&oldest_key);
                }
            }
        }

        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                embedding,
                sequence,
            },
        );
        self.order.push_back((sequence, key.to_string()));

        if self.order.len() > capacity.saturating_mul(2) {
            let entries = &self.entries;
            self.order
                .retain(|(seq, key)| entries.get(key).is_some_and(|e| e.sequence == *seq));
        }
    }
}

/// Cache for embeddings to avoid redundant provider calls.
pub struct EmbeddingCache {
    /// Provider used on a miss.
    provider: Arc<dyn EmbeddingProvider>,

    /// In-memory cache.
    memory: RwLock<MemoryTier>,

    /// Persistent cache storage.
    store: Option<CacheStore<Embedding>>,

    /// Maximum in-memory entries.
    max_entries: usize,

    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a new in-memory cache.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, max_entries: usize) -> Self {
        Self {
            provider,
            memory: RwLock::new(MemoryTier::default()),
            store: None,
            max_entries: max_entries.max(1),
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a cache that also persists entries under `dir`.
    pub async fn with_persistence(
        provider: Arc<dyn EmbeddingProvider>,
        dir: impl AsRef<Path>,
        max_entries: usize,
    ) -> Result<Self> {
        let store = CacheStore::open(dir, None).await?;
        info!("Embedding cache at {}", store.dir().display());

        Ok(Self {
            store: Some(store),
            ..Self::new(provider, max_entries)
        })
    }

    /// The provider computing vectors on a miss.
    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Fingerprint of `content` under the current provider configuration.
    pub fn fingerprint(&self, content: &str) -> String {
        let parameters = self.provider.parameters();
        fingerprint([self.provider.model_id(), parameters.as_str(), content])
    }

    /// Identity of the embedding configuration, without any content.
    pub fn model_key(&self) -> String {
        let parameters = self.provider.parameters();
        fingerprint([self.provider.model_id(), parameters.as_str()])
    }

    /// Look up a cached vector by fingerprint.
    pub async fn lookup(&self, key: &str) -> Option<Embedding> {
        if let Some(embedding) = self.memory.read().await.get(key) {
            return Some(embedding.clone());
        }

        let embedding = self.store.as_ref()?.get(key).await?;
        self.remember(key, embedding.clone()).await;
        Some(embedding)
    }

    /// Embed a single chunk, reusing a cached vector when present.
    pub async fn get_or_compute(&self, content: &str) -> Result<Embedding> {
        self.get_or_compute_batch(&[content.to_string()])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))
    }

    /// Embed a batch of chunks, one vector per input in input order.
    ///
    /// All misses go to the provider in a single call; duplicate contents
    /// are embedded once. Returned vectors are unit-normalized.
    pub async fn get_or_compute_batch(&self, contents: &[String]) -> Result<Vec<Embedding>> {
        let keys: Vec<String> = contents.iter().map(|c| self.fingerprint(c)).collect();

        let mut found: HashMap<&str, Embedding> = HashMap::new();
        let mut pending: HashSet<&str> = HashSet::new();
        let mut miss_positions = Vec::new();

        for (position, key) in keys.iter().enumerate() {
            if found.contains_key(key.as_str()) || pending.contains(key.as_str()) {
                continue;
            }
            match self.lookup(key).await {
                Some(embedding) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key.as_str(), embedding);
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    pending.insert(key.as_str());
                    miss_positions.push(position);
                }
            }
        }

        if !miss_positions.is_empty() {
            let texts: Vec<String> = miss_positions
                .iter()
                .map(|&position| contents[position].clone())
                .collect();

            debug!(
                "Embedding {} uncached chunks with {}",
                texts.len(),
                self.provider.name()
            );
            let vectors = self.provider.embed(&texts).await?;
            validate_batch(texts.len(), &vectors)?;

            for (position, mut vector) in miss_positions.into_iter().zip(vectors) {
                normalize(&mut vector);
                let key = keys[position].as_str();
                self.store_entry(key, vector.clone()).await;
                found.insert(key, vector);
            }
        }

        keys.iter()
            .map(|key| {
                found.get(key.as_str()).cloned().ok_or_else(|| {
                    EmbeddingError::InvalidResponse(format!("missing embedding for {key}"))
                })
            })
            .collect()
    }

    /// Drop any cached vector for `content`.
    pub async fn invalidate(&self, content: &str) -> Result<()> {
        let key = self.fingerprint(content);
        self.memory.write().await.remove(&key);
        if let Some(store) = &self.store {
            store.remove(&key).await?;
        }
        Ok(())
    }

    /// Clear the entire cache.
    pub async fn clear(&self) -> Result<()> {
        self.memory.write().await.clear();
        if let Some(store) = &self.store {
            store.clear().await?;
        }
        info!("Cleared embedding cache");
        Ok(())
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.memory.read().await.len(),
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            model: self.provider.model_id().to_string(),
        }
    }

    async fn store_entry(&self, key: &str, embedding: Embedding) {
        if let Some(store) = &self.store
            && let Err(e) = store.put(key, embedding.clone()).await
        {
            warn!("Failed to persist embedding {key}: {e}");
        }
        self.remember(key, embedding).await;
    }

    async fn remember(&self, key: &str, embedding: Embedding) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.memory
            .write()
            .await
            .insert(key, embedding, sequence, self.max_entries);
    }
}

fn validate_batch(expected: usize, vectors: &[Embedding]) -> Result<()> {
    if vectors.len() != expected {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            vectors.len()
        )));
    }

    let Some(first) = vectors.first() else {
        return Ok(());
    };
    if first.is_empty() {
        return Err(EmbeddingError::InvalidResponse(
            "provider returned an empty vector".to_string(),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != first.len()) {
        return Err(EmbeddingError::InvalidResponse(format!(
            "inconsistent embedding dimensions: {} and {}",
            first.len(),
            bad.len()
        )));
    }
    Ok(())
}

/// Statistics about the embedding cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of entries in memory.
    pub entries: usize,

    /// Maximum in-memory entries.
    pub max_entries: usize,

    /// Lookups answered from the cache.
    pub hits: u64,

    /// Lookups that required the provider.
    pub misses: u64,

    /// Model the cached vectors belong to.
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::HashingProvider;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every batch it is asked to embed.
    #[derive(Default)]
    struct RecordingProvider {
        calls: Mutex<Vec<Vec<String>>>,
        dimension: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }

        fn model_id(&self) -> &str {
            "recording-v1"
        }

        fn dimension(&self) -> Option<usize> {
            Some(self.dimension)
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            self.calls.lock().unwrap().push(texts.to_vec());
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dimension];
                    v[t.len() % self.dimension] = 2.0;
                    v
                })
                .collect())
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_batch_embeds_each_miss_once() {
        let provider = Arc::new(RecordingProvider {
            dimension: 4,
            ..Default::default()
        });
        let cache = EmbeddingCache::new(provider.clone(), 100);

        let vectors = cache
            .get_or_compute_batch(&strings(&["a", "bb", "a"]))
            .await
            .unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2]);
        assert_eq!(vectors[0], vec![0.0, 1.0, 0.0, 0.0]);

        let again = cache
            .get_or_compute_batch(&strings(&["bb", "ccc"]))
            .await
            .unwrap();
        assert_eq!(again[0], vectors[1]);

        let calls = provider.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![strings(&["a", "bb"]), strings(&["ccc"])]);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.model, "recording-v1");
    }

    #[tokio::test]
    async fn test_fingerprint_depends_on_model_configuration() {
        let a = EmbeddingCache::new(Arc::new(HashingProvider::new(16)), 10);
        let b = EmbeddingCache::new(Arc::new(HashingProvider::new(32)), 10);

        assert_eq!(a.fingerprint("text"), a.fingerprint("text"));
        assert_ne!(a.fingerprint("text"), a.fingerprint("other"));
        assert_ne!(a.fingerprint("text"), b.fingerprint("text"));
        assert_eq!(a.fingerprint("text").len(), 64);
    }

    #[tokio::test]
    async fn test_persisted_entries_survive_restart() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(RecordingProvider {
            dimension: 3,
            ..Default::default()
        });

        let first = EmbeddingCache::with_persistence(provider.clone(), dir.path(), 10)
            .await
            .unwrap();
        let vector = first.get_or_compute("hello").await.unwrap();

        let second = EmbeddingCache::with_persistence(provider.clone(), dir.path(), 10)
            .await
            .unwrap();
        assert_eq!(second.get_or_compute("hello").await.unwrap(), vector);
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let provider = Arc::new(RecordingProvider {
            dimension: 3,
            ..Default::default()
        });
        let cache = EmbeddingCache::new(provider.clone(), 10);

        cache.get_or_compute("x").await.unwrap();
        cache.invalidate("x").await.unwrap();
        cache.get_or_compute("x").await.unwrap();
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_eviction() {
        let cache = EmbeddingCache::new(Arc::new(HashingProvider::new(8)), 2);

        cache
            .get_or_compute_batch(&strings(&["a", "b", "c"]))
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn test_memory_tier_evicts_in_insertion_order() {
        let mut tier = MemoryTier::default();
        tier.insert("a", vec![1.0], 0, 2);
        tier.insert("b", vec![2.0], 1, 2);
        // Re-inserting "a" makes "b" the oldest.
        tier.insert("a", vec![1.5], 2, 2);
        tier.insert("c", vec![3.0], 3, 2);

        assert_eq!(tier.len(), 2);
        assert!(tier.get("b").is_none());
        assert_eq!(tier.get("a"), Some(&vec![1.5]));

        // A removed key leaves a stale slot that eviction skips.
        tier.remove("a");
        tier.insert("d", vec![4.0], 4, 2);
        tier.insert("e", vec![5.0], 5, 2);
        assert_eq!(tier.len(), 2);
        assert!(tier.get("c").is_none());
        assert!(tier.get("d").is_some() && tier.get("e").is_some());
        assert!(tier.order.len() <= 4);
    }

    #[test]
    fn test_inconsistent_dimensions_rejected() {
        let vectors = vec![vec![1.0, 0.0], vec![1.0]];
        assert!(matches!(
            validate_batch(2, &vectors),
            Err(EmbeddingError::InvalidResponse(_))
        ));
        assert!(validate_batch(3, &vectors[..1]).is_err());
        assert!(validate_batch(0, &[]).is_ok());
    }
}
