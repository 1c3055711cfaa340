//! Per-collection vector index.
//!
//! Readers search an immutable [`IndexSnapshot`] held behind an `Arc`; every
//! write builds a new snapshot and swaps the pointer, so a search never sees
//! a half-applied update. Writes are serialized by an async mutex that also
//! guards persistence.
//!
//! Full rebuilds run in two phases. [`VectorIndex::begin_rebuild`] hands out
//! a ticket before the (slow) embedding work starts, and
//! [`VectorIndex::commit_rebuild`] applies the result only if no newer
//! rebuild committed in the meantime. Sources updated incrementally after the
//! ticket was issued keep their newer entries.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use docrag_documents::Chunk;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::{dot_product, normalize, top_k};

const VECTORS_FILE: &str = "vectors.bin";
const CHUNKS_FILE: &str = "chunks.json";
const MAGIC: &[u8; 4] = b"DRVX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8;

/// A chunk with its vector, ready to be indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Embedding of the chunk content.
    pub vector: Embedding,

    /// The chunk itself.
    pub chunk: Chunk,

    /// Collection-relative path of the source file.
    pub source_path: String,

    /// Cache fingerprint of the chunk content.
    pub fingerprint: String,
}

/// Row metadata stored alongside the vector matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub source_path: String,
    pub fingerprint: String,
}

/// A search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub source_path: String,
    pub score: f32,
}

/// Immutable index contents: a row-major matrix plus one chunk per row.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    generation: u64,
    dimension: usize,
    vectors: Vec<f32>,
    chunks: Vec<IndexedChunk>,
}

impl IndexSnapshot {
    fn from_entries(generation: u64, entries: Vec<IndexEntry>) -> Result<Self> {
        let dimension = entries.first().map_or(0, |e| e.vector.len());
        let mut vectors = Vec::with_capacity(entries.len() * dimension);
        let mut chunks = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.vector.len() != dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dimension,
                    actual: entry.vector.len(),
                });
            }
            vectors.extend_from_slice(&entry.vector);
            chunks.push(IndexedChunk {
                chunk: entry.chunk,
                source_path: entry.source_path,
                fingerprint: entry.fingerprint,
            });
        }

        Ok(Self {
            generation,
            dimension,
            vectors,
            chunks,
        })
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Vector dimension, `0` while empty.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn row(&self, index: usize) -> &[f32] {
        &self.vectors[index * self.dimension..(index + 1) * self.dimension]
    }

    fn entry(&self, index: usize) -> IndexEntry {
        let indexed = &self.chunks[index];
        IndexEntry {
            vector: self.row(index).to_vec(),
            chunk: indexed.chunk.clone(),
            source_path: indexed.source_path.clone(),
            fingerprint: indexed.fingerprint.clone(),
        }
    }

    fn entries_where(&self, keep: impl Fn(&str) -> bool) -> Vec<IndexEntry> {
        (0..self.len())
            .filter(|&i| keep(&self.chunks[i].source_path))
            .map(|i| self.entry(i))
            .collect()
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut query = query.to_vec();
        normalize(&mut query);

        let scores = (0..self.len())
            .map(|i| dot_product(&query, self.row(i)))
            .collect::<Result<Vec<f32>>>()?;

        Ok(top_k(&scores, k)
            .into_iter()
            .map(|(i, score)| SearchHit {
                chunk: self.chunks[i].chunk.clone(),
                source_path: self.chunks[i].source_path.clone(),
                score,
            })
            .collect())
    }
}

/// Handle for an in-progress full rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildTicket(u64);

/// Result of committing a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// The rebuild replaced the index contents.
    Applied { generation: u64, chunk_count: usize },
    /// A newer rebuild committed first; this one was discarded.
    Superseded,
}

#[derive(Debug, Default)]
struct WriterState {
    last_rebuild: u64,
    /// Generation of the latest incremental write per source.
    touched: HashMap<String, u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedChunks {
    generation: u64,
    dimension: usize,
    /// Identity of the embedding configuration that produced the vectors.
    #[serde(default)]
    model: Option<String>,
    entries: Vec<IndexedChunk>,
}

/// Vector index of one collection.
pub struct VectorIndex {
    name: String,
    dir: Option<PathBuf>,
    model: Option<String>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<WriterState>,
    generation: AtomicU64,
}

impl VectorIndex {
    /// Create an in-memory index.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: None,
            model: None,
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            writer: Mutex::new(WriterState::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Create an index persisted under `dir`.
    pub fn with_dir(name: impl Into<String>, dir: impl AsRef<Path>) -> Self {
        Self {
            dir: Some(dir.as_ref().to_path_buf()),
            ..Self::new(name)
        }
    }

    /// Tag the index with the embedding configuration writing to it.
    ///
    /// Persisted state written under a different tag is not loaded.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// The current snapshot. Stays valid while later writes swap in new ones.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap(&self, snapshot: IndexSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.snapshot().dimension()
    }

    /// Generation of the visible snapshot.
    pub fn generation(&self) -> u64 {
        self.snapshot().generation()
    }

    /// Source paths with at least one indexed chunk.
    pub fn sources(&self) -> BTreeSet<String> {
        self.snapshot()
            .chunks
            .iter()
            .map(|c| c.source_path.clone())
            .collect()
    }

    /// Indexed entries of one source, in index order.
    pub fn entries_for_source(&self, source: &str) -> Vec<IndexEntry> {
        self.snapshot().entries_where(|s| s == source)
    }

    /// Top `k` chunks by cosine similarity to `query`, best first.
    ///
    /// An empty index yields no hits. Equal scores keep index order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.snapshot().search(query, k)
    }

    /// Start a full rebuild.
    pub fn begin_rebuild(&self) -> RebuildTicket {
        RebuildTicket(self.next_generation())
    }

    /// Replace the whole index with `entries` unless a newer rebuild won.
    pub async fn commit_rebuild(
        &self,
        ticket: RebuildTicket,
        mut entries: Vec<IndexEntry>,
    ) -> Result<RebuildOutcome> {
        let mut writer = self.writer.lock().await;
        if ticket.0 < writer.last_rebuild {
            info!(
                "Discarding superseded rebuild of {} (ticket {})",
                self.name, ticket.0
            );
            return Ok(RebuildOutcome::Superseded);
        }

        let newer: HashSet<String> = writer
            .touched
            .iter()
            .filter(|(_, generation)| **generation > ticket.0)
            .map(|(source, _)| source.clone())
            .collect();

        for entry in &mut entries {
            normalize(&mut entry.vector);
        }
        if !newer.is_empty() {
            debug!(
                "Keeping {} sources updated during rebuild of {}",
                newer.len(),
                self.name
            );
            entries.retain(|e| !newer.contains(&e.source_path));
            entries.extend(self.snapshot().entries_where(|s| newer.contains(s)));
        }

        let generation = self.next_generation();
        let snapshot = IndexSnapshot::from_entries(generation, entries)?;
        let chunk_count = snapshot.len();
        self.swap(snapshot);

        writer.last_rebuild = ticket.0;
        writer.touched.retain(|_, g| *g > ticket.0);

        info!(
            "Rebuilt index {} with {chunk_count} chunks (generation {generation})",
            self.name
        );
        Ok(RebuildOutcome::Applied {
            generation,
            chunk_count,
        })
    }

    /// Replace the whole index with `entries`.
    pub async fn rebuild(&self, entries: Vec<IndexEntry>) -> Result<RebuildOutcome> {
        let ticket = self.begin_rebuild();
        self.commit_rebuild(ticket, entries).await
    }

    /// Replace every entry of `source` with `entries`.
    ///
    /// Other sources keep their rows and relative order; the new rows go to
    /// the end of the index.
    pub async fn upsert_for_source(&self, source: &str, entries: Vec<IndexEntry>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let current = self.snapshot();

        let mut incoming = entries;
        for entry in &mut incoming {
            if !current.is_empty() && entry.vector.len() != current.dimension() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: current.dimension(),
                    actual: entry.vector.len(),
                });
            }
            normalize(&mut entry.vector);
            entry.source_path = source.to_string();
        }

        let replaced = current.entries_where(|s| s == source).len();
        let mut merged = current.entries_where(|s| s != source);
        let added = incoming.len();
        merged.extend(incoming);

        let generation = self.next_generation();
        self.swap(IndexSnapshot::from_entries(generation, merged)?);
        writer.touched.insert(source.to_string(), generation);

        debug!(
            "Index {}: {source} replaced {replaced} chunks with {added}",
            self.name
        );
        Ok(())
    }

    /// Remove every entry of `source`, returning how many were removed.
    pub async fn remove_source(&self, source: &str) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let current = self.snapshot();
        let remaining = current.entries_where(|s| s != source);
        let removed = current.len() - remaining.len();

        let generation = self.next_generation();
        if removed > 0 {
            self.swap(IndexSnapshot::from_entries(generation, remaining)?);
            debug!("Index {}: removed {removed} chunks of {source}", self.name);
        }
        writer.touched.insert(source.to_string(), generation);
        Ok(removed)
    }

    /// Write the current snapshot to disk. No-op for in-memory indexes.
    pub async fn persist(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let _writer = self.writer.lock().await;
        let snapshot = self.snapshot();
        fs::create_dir_all(dir).await?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + snapshot.vectors.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&snapshot.generation.to_le_bytes());
        bytes.extend_from_slice(&(snapshot.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&(snapshot.dimension as u64).to_le_bytes());
        for value in &snapshot.vectors {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let chunks = serde_json::to_vec(&PersistedChunks {
            generation: snapshot.generation,
            dimension: snapshot.dimension,
            model: self.model.clone(),
            entries: snapshot.chunks.clone(),
        })?;

        write_atomic(&dir.join(VECTORS_FILE), &bytes).await?;
        write_atomic(&dir.join(CHUNKS_FILE), &chunks).await?;

        debug!(
            "Persisted index {} ({} chunks, generation {})",
            self.name,
            snapshot.len(),
            snapshot.generation
        );
        Ok(())
    }

    /// Load persisted artifacts.
    ///
    /// Returns `false` when nothing usable is on disk: missing files, files
    /// that disagree with each other, or vectors from another embedding
    /// configuration. The caller is expected to rebuild in that case.
    pub async fn load(&self) -> Result<bool> {
        let Some(dir) = &self.dir else {
            return Ok(false);
        };

        let _writer = self.writer.lock().await;
        let (snapshot, model) = match read_artifacts(dir).await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return Ok(false),
            Err(e @ (EmbeddingError::IndexCorrupted(_) | EmbeddingError::Serialization(_))) => {
                warn!("Ignoring persisted index {}: {e}", self.name);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if self.model.is_some() && model != self.model {
            warn!(
                "Ignoring persisted index {}: built with {}, expected {}",
                self.name,
                model.as_deref().unwrap_or("an unknown model"),
                self.model.as_deref().unwrap_or_default()
            );
            return Ok(false);
        }

        self.generation
            .fetch_max(snapshot.generation, Ordering::SeqCst);
        info!(
            "Loaded index {} ({} chunks, generation {})",
            self.name,
            snapshot.len(),
            snapshot.generation
        );
        self.swap(snapshot);
        Ok(true)
    }

    /// Delete persisted artifacts.
    pub async fn delete_persisted(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let _writer = self.writer.lock().await;
        match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

async fn read_artifacts(dir: &Path) -> Result<Option<(IndexSnapshot, Option<String>)>> {
    let (Some(vectors), Some(chunks)) = (
        read_optional(&dir.join(VECTORS_FILE)).await?,
        read_optional(&dir.join(CHUNKS_FILE)).await?,
    ) else {
        return Ok(None);
    };

    if vectors.len() < HEADER_LEN || &vectors[..4] != MAGIC {
        return Err(EmbeddingError::IndexCorrupted(
            "vectors.bin has no valid header".to_string(),
        ));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&vectors[4..8]);
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(EmbeddingError::IndexCorrupted(format!(
            "unsupported format version {version}"
        )));
    }

    let generation = read_u64(&vectors, 8);
    let rows = read_u64(&vectors, 16) as usize;
    let dimension = read_u64(&vectors, 24) as usize;
    let body = &vectors[HEADER_LEN..];
    if rows.checked_mul(dimension).and_then(|n| n.checked_mul(4)) != Some(body.len()) {
        return Err(EmbeddingError::IndexCorrupted(format!(
            "expected {rows}x{dimension} vectors, found {} bytes",
            body.len()
        )));
    }

    let persisted: PersistedChunks = serde_json::from_slice(&chunks)?;
    if persisted.generation != generation
        || persisted.dimension != dimension
        || persisted.entries.len() != rows
    {
        return Err(EmbeddingError::IndexCorrupted(format!(
            "chunks.json (generation {}, {} rows) does not match vectors.bin (generation {generation}, {rows} rows)",
            persisted.generation,
            persisted.entries.len()
        )));
    }

    let vectors = body
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(Some((
        IndexSnapshot {
            generation,
            dimension,
            vectors,
            chunks: persisted.entries,
        },
        persisted.model,
    )))
}
