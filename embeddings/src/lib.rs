//! # Embeddings
//!
//! Embedding providers, the fingerprint-keyed embedding cache and the
//! per-collection vector index used by docrag.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Chunk ──► EmbeddingCache ──► EmbeddingProvider                 │
//! │                │                    │                           │
//! │                ▼                    ▼                           │
//! │          CacheStore (disk)    OpenAI / Hashing                  │
//! │                                                                 │
//! │  IndexEntry ──► VectorIndex ──► IndexSnapshot ──► SearchHit     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod error;
pub mod index;
pub mod provider;
pub mod similarity;
pub mod store;

use sha2::{Digest, Sha256};

pub use cache::{CacheStats, EmbeddingCache};
pub use error::{EmbeddingError, Result};
pub use index::{
    IndexEntry, IndexSnapshot, IndexedChunk, RebuildOutcome, RebuildTicket, SearchHit,
    VectorIndex,
};
pub use provider::{EmbeddingProvider, HashingProvider, OpenAIProvider};
pub use similarity::{dot_product, normalize, top_k};
pub use store::{CacheEntry, CacheStore};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// Hex SHA-256 over length-prefixed parts.
///
/// Length prefixes keep `["ab", "c"]` and `["a", "bc"]` distinct.
pub fn fingerprint<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_separates_parts() {
        assert_ne!(fingerprint(["ab", "c"]), fingerprint(["a", "bc"]));
        assert_eq!(fingerprint(["x"]), fingerprint(["x"]));
        assert_eq!(fingerprint(Vec::<&str>::new()).len(), 64);
    }
}
