//! Configuration for the retrieval engine.
//!
//! Loaded from TOML, then overridden by `RAG_*` environment variables, then
//! validated. Every section has defaults, so an empty file is a valid
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use docrag_documents::ChunkerConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, RetrievalError};

/// Configuration for the retrieval engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Root of all persisted state (collections, indices, caches).
    pub data_dir: PathBuf,

    /// Chunking configuration.
    pub chunking: ChunkingConfig,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,

    /// Generation provider configuration.
    pub generation: GenerationConfig,

    /// Query configuration.
    pub query: QueryConfig,

    /// Watch configuration.
    pub watch: WatchConfig,
}

impl RagConfig {
    /// Create a configuration with default values rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            query: QueryConfig::default(),
            watch: WatchConfig::default(),
        }
    }

    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("docrag").join("config.toml"))
    }

    /// Load the configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used if present, and the defaults otherwise. Environment overrides
    /// are applied on top and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("No configuration file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RetrievalError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&content)
            .map_err(|e| RetrievalError::Config(format!("{}: {e}", path.display())))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RetrievalError::Config(e.to_string()))
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RetrievalError::Config(e.to_string()))
    }

    /// Apply `RAG_*` overrides, reading variables through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("RAG_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("RAG_CHUNK_SIZE") {
            self.chunking.chunk_size = parse_env("RAG_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = lookup("RAG_CHUNK_OVERLAP") {
            self.chunking.chunk_overlap = parse_env("RAG_CHUNK_OVERLAP", &value)?;
        }
        if let Some(value) = lookup("RAG_PRESERVE_MARKDOWN") {
            self.chunking.preserve_structure = parse_bool("RAG_PRESERVE_MARKDOWN", &value)?;
        }
        if let Some(model) = lookup("RAG_EMBED_MODEL") {
            self.embedding.embedding_model_identifier = model;
        }
        if let Some(value) = lookup("RAG_MAX_RESULTS") {
            self.query.max_results = parse_env("RAG_MAX_RESULTS", &value)?;
        }
        if let Some(value) = lookup("RAG_DEBOUNCE_SECONDS") {
            self.watch.debounce_seconds = parse_env("RAG_DEBOUNCE_SECONDS", &value)?;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.chunker_config().validate()?;

        if self.embedding.batch_size == 0 {
            return Err(RetrievalError::Config(
                "embedding.batch_size must be at least 1".to_string(),
            ));
        }
        if self.embedding.cache_max_entries == 0 {
            return Err(RetrievalError::Config(
                "embedding.cache_max_entries must be at least 1".to_string(),
            ));
        }
        if self.embedding.dimensions == Some(0) {
            return Err(RetrievalError::Config(
                "embedding.dimensions must be at least 1".to_string(),
            ));
        }
        if self.query.max_results == 0 {
            return Err(RetrievalError::Config(
                "query.max_results must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(RetrievalError::Config(format!(
                "generation.temperature must be within 0.0..=2.0, got {}",
                self.generation.temperature
            )));
        }
        if !self.watch.debounce_seconds.is_finite() || self.watch.debounce_seconds < 0.0 {
            return Err(RetrievalError::Config(format!(
                "watch.debounce_seconds must be a non-negative number, got {}",
                self.watch.debounce_seconds
            )));
        }
        if self.watch.channel_capacity == 0 {
            return Err(RetrievalError::Config(
                "watch.channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Splitter settings derived from the chunking section.
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_chunk_size: self.chunking.chunk_size,
            overlap: self.chunking.chunk_overlap,
            preserve_structure: self.chunking.preserve_structure,
        }
    }

    pub fn collections_dir(&self) -> PathBuf {
        self.data_dir.join("collections")
    }

    pub fn indices_dir(&self) -> PathBuf {
        self.data_dir.join("indices")
    }

    pub fn embedding_cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("embeddings")
    }

    pub fn answer_cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("answers")
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self::new(dirs::data_dir().unwrap_or_default().join("docrag"))
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RetrievalError::Config(format!("{key}={value:?}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RetrievalError::Config(format!(
            "{key}={value:?}: expected a boolean"
        ))),
    }
}

/// Configuration for chunking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters.
    pub chunk_size: usize,

    /// Characters carried from one chunk into the next.
    pub chunk_overlap: usize,

    /// Split along headings and paragraphs rather than sentences.
    pub preserve_structure: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            preserve_structure: true,
        }
    }
}

/// Configuration for the embedding provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Which provider to use.
    pub provider: EmbeddingProviderType,

    /// Model requested from an OpenAI-compatible endpoint.
    pub embedding_model_identifier: String,

    /// Endpoint base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: Option<String>,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// Output dimension. For the hashing provider this is the vector length.
    pub dimensions: Option<usize>,

    /// Maximum texts per provider request.
    pub batch_size: usize,

    /// Maximum in-memory cache entries.
    pub cache_max_entries: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderType::Hashing,
            embedding_model_identifier: "all-MiniLM-L6-v2".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            dimensions: None,
            batch_size: 32,
            cache_max_entries: 10000,
        }
    }
}

/// Type of embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderType {
    /// OpenAI-compatible embeddings API.
    #[serde(rename = "openai")]
    OpenAI,
    /// Offline feature hashing.
    Hashing,
}

/// Configuration for the generation provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Which provider to use.
    pub provider: GenerationProviderType,

    /// Chat model name.
    pub model: String,

    /// Endpoint base URL.
    pub base_url: Option<String>,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProviderType::OpenAI,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// Type of generation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationProviderType {
    /// OpenAI-compatible chat completions API.
    #[serde(rename = "openai")]
    OpenAI,
    /// Retrieval only; answering fails.
    Disabled,
}

/// Configuration for query processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Number of chunks retrieved per query.
    pub max_results: usize,

    /// Lifetime of cached answers.
    pub answer_ttl_hours: u32,
}

impl QueryConfig {
    pub fn answer_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.answer_ttl_hours))
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            answer_ttl_hours: 24,
        }
    }
}

/// Configuration for directory watching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period after the last event of a file.
    pub debounce_seconds: f64,

    /// Start watchers for realtime collections.
    pub realtime: bool,

    /// Capacity of each collection's event channel.
    pub channel_capacity: usize,
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_seconds.max(0.0))
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: 1.0,
            realtime: true,
            channel_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RagConfig::new("/tmp/docrag");
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert!(config.chunking.preserve_structure);
        assert_eq!(config.embedding.embedding_model_identifier, "all-MiniLM-L6-v2");
        assert_eq!(config.query.max_results, 5);
        assert_eq!(config.query.answer_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.watch.debounce(), Duration::from_secs(1));
        assert_eq!(config.generation.max_tokens, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RagConfig::from_toml(
            r#"
            data_dir = "/srv/docrag"

            [chunking]
            chunk_size = 800

            [embedding]
            provider = "openai"
            embedding_model_identifier = "text-embedding-3-small"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/docrag"));
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.embedding.provider, EmbeddingProviderType::OpenAI);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.indices_dir(), PathBuf::from("/srv/docrag/indices"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = RagConfig::new("/tmp/docrag");
        let parsed = RagConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("RAG_DATA_DIR", "/var/lib/docrag"),
            ("RAG_CHUNK_SIZE", "300"),
            ("RAG_CHUNK_OVERLAP", "20"),
            ("RAG_PRESERVE_MARKDOWN", "false"),
            ("RAG_EMBED_MODEL", "nomic-embed-text"),
            ("RAG_MAX_RESULTS", "8"),
            ("RAG_DEBOUNCE_SECONDS", "0.25"),
        ]);

        let mut config = RagConfig::new("/tmp/docrag");
        config
            .apply_env_overrides(|key| vars.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/docrag"));
        assert_eq!(config.chunking.chunk_size, 300);
        assert_eq!(config.chunking.chunk_overlap, 20);
        assert!(!config.chunking.preserve_structure);
        assert_eq!(config.embedding.embedding_model_identifier, "nomic-embed-text");
        assert_eq!(config.query.max_results, 8);
        assert_eq!(config.watch.debounce(), Duration::from_millis(250));
    }

    #[test]
    fn test_bad_env_value_is_a_config_error() {
        let mut config = RagConfig::new("/tmp/docrag");
        let result = config.apply_env_overrides(|key| {
            (key == "RAG_CHUNK_SIZE").then(|| "big".to_string())
        });
        assert!(matches!(result, Err(RetrievalError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = RagConfig::new("/tmp/docrag");
        config.chunking.chunk_overlap = 500;
        assert!(matches!(config.validate(), Err(RetrievalError::Config(_))));

        let mut config = RagConfig::new("/tmp/docrag");
        config.query.max_results = 0;
        assert!(config.validate().is_err());

        let mut config = RagConfig::new("/tmp/docrag");
        config.generation.temperature = 3.5;
        assert!(config.validate().is_err());

        let mut config = RagConfig::new("/tmp/docrag");
        config.watch.debounce_seconds = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = RagConfig::load(Some(&dir.path().join("missing.toml")));
        assert!(matches!(result, Err(RetrievalError::Config(_))));
    }
}
