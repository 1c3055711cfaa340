//! Retrieval engine implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use docrag_directory_watcher::{
    ChangeHandler, Collection, CollectionIndexer, CollectionRegistry, DirectoryWatcher,
    IndexReport, WatchOptions,
};
use docrag_documents::DocumentProcessor;
use docrag_embeddings::{
    CacheStats, CacheStore, EmbeddingCache, EmbeddingProvider, HashingProvider, OpenAIProvider,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::IndexCatalog;
use crate::config::{
    EmbeddingConfig, EmbeddingProviderType, GenerationConfig, GenerationProviderType, RagConfig,
};
use crate::error::Result;
use crate::generation::{GenerationProvider, OpenAIChatProvider};
use crate::orchestrator::{Answer, AnswerStream, GenerationSettings, QueryOrchestrator, Source};

/// The retrieval engine.
///
/// This is the main entry point of docrag. It coordinates:
/// - the collection registry
/// - one vector index per collection
/// - the shared embedding cache
/// - directory watchers driving incremental updates
/// - query answering
pub struct RagEngine {
    config: RagConfig,
    registry: Arc<CollectionRegistry>,
    catalog: Arc<IndexCatalog>,
    processor: Arc<DocumentProcessor>,
    embeddings: Arc<EmbeddingCache>,
    watcher: DirectoryWatcher,
    orchestrator: QueryOrchestrator,

    /// Whether `start` has run; watchers are only managed while started.
    started: AtomicBool,
}

impl RagEngine {
    /// Create a new engine builder.
    pub fn builder() -> RagEngineBuilder {
        RagEngineBuilder::new()
    }

    /// Create an engine from a configuration with the configured providers.
    pub async fn new(config: RagConfig) -> Result<Self> {
        RagEngineBuilder::new().with_config(config).build().await
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Load persisted indices, rebuild the missing ones and start watchers.
    pub async fn start(&self) -> Result<()> {
        for collection in self.registry.list().await {
            let (index, loaded) = self.catalog.open(&collection.name).await?;
            if !loaded && collection.enabled {
                info!("No usable index for {}, rebuilding", collection.name);
                if let Err(e) = self.indexer(&collection).await?.reindex_all().await {
                    error!("Failed to index collection {}: {e}", collection.name);
                }
            } else {
                debug!("Collection {} ready ({} chunks)", collection.name, index.len());
            }
        }

        self.started.store(true, Ordering::SeqCst);
        for collection in self.registry.list().await {
            self.watch_if_needed(&collection).await?;
        }

        info!(
            "Engine started: {} collections, {} watched",
            self.registry.list().await.len(),
            self.watcher.watched().await.len()
        );
        Ok(())
    }

    /// Stop all watchers, waiting for in-flight updates.
    pub async fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.watcher.stop_all().await;
        info!("Engine stopped");
    }

    /// Register a collection. It is watched right away if the engine is
    /// running; indexing is explicit.
    pub async fn register_collection(&self, collection: Collection) -> Result<Collection> {
        let collection = self.registry.register(collection).await?;
        self.catalog.get_or_load(&collection.name).await?;
        self.watch_if_needed(&collection).await?;
        Ok(collection)
    }

    pub async fn get_collection(&self, name: &str) -> Result<Collection> {
        Ok(self.registry.get(name).await?)
    }

    /// All collections, ordered by name.
    pub async fn list_collections(&self) -> Vec<Collection> {
        self.registry.list().await
    }

    pub async fn enable_collection(&self, name: &str) -> Result<Collection> {
        let collection = self.registry.enable(name).await?;
        self.watch_if_needed(&collection).await?;
        Ok(collection)
    }

    pub async fn disable_collection(&self, name: &str) -> Result<Collection> {
        let collection = self.registry.disable(name).await?;
        if self.watcher.unwatch(name).await {
            info!("Stopped watching {name}");
        }
        Ok(collection)
    }

    /// Remove a collection: stop its watcher, delete its index and its record.
    pub async fn remove_collection(&self, name: &str) -> Result<Collection> {
        self.registry.get(name).await?;
        self.watcher.unwatch(name).await;
        self.catalog.remove(name).await?;
        let collection = self.registry.remove(name).await?;
        info!("Removed collection {name} and its index");
        Ok(collection)
    }

    /// Rebuild a collection's index from the files on disk.
    pub async fn index_collection(&self, name: &str) -> Result<IndexReport> {
        let collection = self.registry.get(name).await?;
        Ok(self.indexer(&collection).await?.reindex_all().await?)
    }

    /// Answer `query` from one collection or all enabled ones.
    ///
    /// `max_results` defaults to the configured value.
    pub async fn answer(
        &self,
        query: &str,
        collection: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Answer> {
        self.orchestrator
            .answer(query, collection, self.max_results(max_results))
            .await
    }

    /// Like [`answer`](Self::answer), streaming the generated text.
    pub async fn answer_stream(
        &self,
        query: &str,
        collection: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<AnswerStream> {
        self.orchestrator
            .answer_stream(query, collection, self.max_results(max_results))
            .await
    }

    /// Ranked chunks for `query`, without generation.
    pub async fn search(
        &self,
        query: &str,
        collection: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Vec<Source>> {
        self.orchestrator
            .retrieve(query, collection, self.max_results(max_results))
            .await
    }

    /// Get engine statistics.
    pub async fn stats(&self) -> EngineStats {
        let collections = self.registry.list().await;
        let mut indexed_chunks = 0;
        for collection in &collections {
            if let Some(index) = self.catalog.get(&collection.name).await {
                indexed_chunks += index.len();
            }
        }

        EngineStats {
            collections: collections.len(),
            enabled_collections: collections.iter().filter(|c| c.enabled).count(),
            indexed_chunks,
            watched_collections: self.watcher.watched().await.len(),
            embedding_cache: self.embeddings.stats().await,
        }
    }

    fn max_results(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.config.query.max_results)
    }

    /// An indexer over the collection's index, loaded from disk first so
    /// writes never start from an empty index.
    async fn indexer(&self, collection: &Collection) -> Result<CollectionIndexer> {
        Ok(CollectionIndexer::new(
            collection.clone(),
            self.processor.clone(),
            self.embeddings.clone(),
            self.catalog.get_or_load(&collection.name).await?,
            self.registry.clone(),
        ))
    }

    async fn watch_if_needed(&self, collection: &Collection) -> Result<()> {
        if !self.started.load(Ordering::SeqCst)
            || !self.config.watch.realtime
            || !collection.is_watched()
        {
            return Ok(());
        }

        let handler: Arc<dyn ChangeHandler> = Arc::new(self.indexer(collection).await?);
        if let Err(e) = self.watcher.watch(collection, handler).await {
            warn!("Could not watch collection {}: {e}", collection.name);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Builder for [`RagEngine`].
pub struct RagEngineBuilder {
    config: RagConfig,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    generation_provider: Option<Arc<dyn GenerationProvider>>,
}

impl RagEngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RagConfig::default(),
            embedding_provider: None,
            generation_provider: None,
        }
    }

    pub fn with_config(mut self, config: RagConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// Use `provider` instead of the configured embedding provider.
    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Use `provider` instead of the configured generation provider.
    pub fn with_generation_provider(mut self, provider: Arc<dyn GenerationProvider>) -> Self {
        self.generation_provider = Some(provider);
        self
    }

    /// Enable or disable realtime watching.
    pub fn with_realtime_watch(mut self, enabled: bool) -> Self {
        self.config.watch.realtime = enabled;
        self
    }

    /// Build the engine.
    pub async fn build(self) -> Result<RagEngine> {
        let config = self.config;
        config.validate()?;
        info!("Initializing engine in {}", config.data_dir.display());
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let registry = Arc::new(CollectionRegistry::open(config.collections_dir()).await?);
        let processor = Arc::new(DocumentProcessor::new(config.chunker_config())?);

        let provider = self
            .embedding_provider
            .unwrap_or_else(|| embedding_provider(&config.embedding));
        if !provider.is_available() {
            warn!("Embedding provider {} is not available", provider.name());
        }
        let embeddings = Arc::new(
            EmbeddingCache::with_persistence(
                provider,
                config.embedding_cache_dir(),
                config.embedding.cache_max_entries,
            )
            .await?,
        );
        let catalog =
            Arc::new(IndexCatalog::new(config.indices_dir()).with_model(embeddings.model_key()));

        let answers =
            CacheStore::open(config.answer_cache_dir(), Some(config.query.answer_ttl())).await?;
        let mut orchestrator =
            QueryOrchestrator::new(registry.clone(), catalog.clone(), embeddings.clone())
                .with_answer_cache(answers)
                .with_settings(GenerationSettings {
                    max_tokens: config.generation.max_tokens,
                    temperature: config.generation.temperature,
                });
        match self
            .generation_provider
            .or_else(|| generation_provider(&config.generation))
        {
            Some(generator) => orchestrator = orchestrator.with_generator(generator),
            None => info!("Generation disabled; only search is available"),
        }

        let watcher = DirectoryWatcher::new(WatchOptions {
            debounce: config.watch.debounce(),
            channel_capacity: config.watch.channel_capacity,
        });

        Ok(RagEngine {
            config,
            registry,
            catalog,
            processor,
            embeddings,
            watcher,
            orchestrator,
            started: AtomicBool::new(false),
        })
    }
}

impl Default for RagEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn embedding_provider(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match config.provider {
        EmbeddingProviderType::Hashing => match config.dimensions {
            Some(dimension) => Arc::new(HashingProvider::new(dimension)),
            None => Arc::new(HashingProvider::default()),
        },
        EmbeddingProviderType::OpenAI => {
            let mut provider = OpenAIProvider::new()
                .with_model(&config.embedding_model_identifier)
                .with_batch_size(config.batch_size);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url);
            }
            if let Ok(key) = std::env::var(&config.api_key_env) {
                provider = provider.with_api_key(key);
            }
            if let Some(dimensions) = config.dimensions {
                provider = provider.with_dimensions(dimensions);
            }
            Arc::new(provider)
        }
    }
}

fn generation_provider(config: &GenerationConfig) -> Option<Arc<dyn GenerationProvider>> {
    match config.provider {
        GenerationProviderType::Disabled => None,
        GenerationProviderType::OpenAI => {
            let mut provider = OpenAIChatProvider::new()
                .without_api_key()
                .with_model(&config.model);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url);
            }
            if let Ok(key) = std::env::var(&config.api_key_env) {
                provider = provider.with_api_key(key);
            }
            Some(Arc::new(provider))
        }
    }
}

/// Statistics about the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Number of registered collections.
    pub collections: usize,

    /// Number of enabled collections.
    pub enabled_collections: usize,

    /// Chunks across all open indices.
    pub indexed_chunks: usize,

    /// Number of running watchers.
    pub watched_collections: usize,

    /// Embedding cache counters.
    pub embedding_cache: CacheStats,
}
