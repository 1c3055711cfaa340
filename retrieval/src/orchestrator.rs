//! Query orchestration: retrieve, ground, generate, cache.
//!
//! A query is embedded through the same [`EmbeddingCache`] the indexer uses,
//! searched against one or all enabled collections, and the merged hits are
//! turned into a grounded prompt. Answers are cached by a fingerprint of the
//! prompt and the system preamble, so the same question over the same
//! retrieved context is answered once per TTL.

use std::sync::Arc;

use async_stream::try_stream;
use docrag_directory_watcher::{Collection, CollectionRegistry};
use docrag_embeddings::{CacheStore, EmbeddingCache, fingerprint};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::IndexCatalog;
use crate::error::{Result, RetrievalError};
use crate::generation::{GenerationProvider, GenerationRequest, TextStream, boxed_stream};

/// Answer returned when retrieval finds nothing.
pub const NO_RESULTS_ANSWER: &str = "No relevant information found.";

/// Instruction preamble sent as the system prompt.
pub const SYSTEM_PROMPT: &str = "You are a helpful AI assistant answering questions based on the provided context.
Use the following context to answer the question. If you cannot answer the question based on the context,
say so clearly. Do not make up information.";

/// A retrieved chunk, as shown to the caller and the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Chunk text.
    pub content: String,

    /// Collection-relative path of the file the chunk came from.
    pub source: String,

    /// Collection the chunk belongs to.
    pub collection: String,

    /// Cosine similarity to the query.
    pub score: f32,
}

/// A grounded answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,

    /// Whether the answer was served from the answer cache.
    pub cached: bool,
}

/// A grounded answer delivered incrementally.
pub struct AnswerStream {
    pub sources: Vec<Source>,
    pub cached: bool,
    pub text: TextStream,
}

impl std::fmt::Debug for AnswerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerStream")
            .field("sources", &self.sources)
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}

/// Sampling parameters for generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// Answers questions from the indexed collections.
pub struct QueryOrchestrator {
    registry: Arc<CollectionRegistry>,
    catalog: Arc<IndexCatalog>,
    embeddings: Arc<EmbeddingCache>,
    generator: Option<Arc<dyn GenerationProvider>>,
    answers: Option<Arc<CacheStore<String>>>,
    settings: GenerationSettings,
}

impl QueryOrchestrator {
    pub fn new(
        registry: Arc<CollectionRegistry>,
        catalog: Arc<IndexCatalog>,
        embeddings: Arc<EmbeddingCache>,
    ) -> Self {
        Self {
            registry,
            catalog,
            embeddings,
            generator: None,
            answers: None,
            settings: GenerationSettings::default(),
        }
    }

    /// Set the generation provider.
    pub fn with_generator(mut self, generator: Arc<dyn GenerationProvider>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Cache answers in `store`.
    pub fn with_answer_cache(mut self, store: CacheStore<String>) -> Self {
        self.answers = Some(Arc::new(store));
        self
    }

    /// Set the sampling parameters.
    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Retrieve the `max_results` chunks most similar to `query`.
    ///
    /// With a collection name only that collection is searched, enabled or
    /// not. Without one, every enabled collection is searched and the hits
    /// are merged by score.
    pub async fn retrieve(
        &self,
        query: &str,
        collection: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<Source>> {
        if self.registry.is_empty().await {
            return Err(RetrievalError::NoCollectionsConfigured);
        }

        let targets: Vec<Collection> = match collection {
            Some(name) => vec![self.registry.get(name).await?],
            None => self
                .registry
                .list()
                .await
                .into_iter()
                .filter(|c| c.enabled)
                .collect(),
        };
        if targets.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embeddings.get_or_compute(query).await?;

        let mut sources = Vec::new();
        for target in &targets {
            let index = match self.catalog.get_or_load(&target.name).await {
                Ok(index) => index,
                Err(e) => {
                    warn!("Skipping collection {} in search: {e}", target.name);
                    continue;
                }
            };
            match index.search(&vector, max_results) {
                Ok(hits) => sources.extend(hits.into_iter().map(|hit| Source {
                    content: hit.chunk.content,
                    source: hit.source_path,
                    collection: target.name.clone(),
                    score: hit.score,
                })),
                Err(e) => warn!("Skipping collection {} in search: {e}", target.name),
            }
        }

        sources.sort_by(|a, b| b.score.total_cmp(&a.score));
        sources.truncate(max_results);
        debug!(
            "Retrieved {} chunks from {} collections",
            sources.len(),
            targets.len()
        );
        Ok(sources)
    }

    /// Answer `query` from the retrieved context.
    pub async fn answer(
        &self,
        query: &str,
        collection: Option<&str>,
        max_results: usize,
    ) -> Result<Answer> {
        let sources = self.retrieve(query, collection, max_results).await?;
        if sources.is_empty() {
            return Ok(Answer {
                answer: NO_RESULTS_ANSWER.to_string(),
                sources,
                cached: false,
            });
        }

        let request = self.request(query, &sources);
        let key = answer_key(&request);
        if let Some(answer) = self.cached_answer(&key).await {
            return Ok(Answer {
                answer,
                sources,
                cached: true,
            });
        }

        let generator = self.generator()?;
        let answer = generator.generate(&request).await?;
        store_answer(self.answers.as_deref(), &key, &answer).await;
        info!("Answered query from {} sources", sources.len());

        Ok(Answer {
            answer,
            sources,
            cached: false,
        })
    }

    /// Answer `query`, streaming the generated text.
    ///
    /// The concatenated answer is cached once the stream completes. A stream
    /// dropped early or ending in an error caches nothing.
    pub async fn answer_stream(
        &self,
        query: &str,
        collection: Option<&str>,
        max_results: usize,
    ) -> Result<AnswerStream> {
        let sources = self.retrieve(query, collection, max_results).await?;
        if sources.is_empty() {
            return Ok(AnswerStream {
                sources,
                cached: false,
                text: single(NO_RESULTS_ANSWER.to_string()),
            });
        }

        let request = self.request(query, &sources);
        let key = answer_key(&request);
        if let Some(answer) = self.cached_answer(&key).await {
            return Ok(AnswerStream {
                sources,
                cached: true,
                text: single(answer),
            });
        }

        let mut deltas = self.generator()?.generate_stream(&request).await?;
        let answers = self.answers.clone();
        let text = try_stream! {
            let mut answer = String::new();
            while let Some(delta) = deltas.next().await {
                let delta = delta?;
                answer.push_str(&delta);
                yield delta;
            }
            store_answer(answers.as_deref(), &key, &answer).await;
        };

        Ok(AnswerStream {
            sources,
            cached: false,
            text: boxed_stream(text),
        })
    }

    fn request(&self, query: &str, sources: &[Source]) -> GenerationRequest {
        GenerationRequest {
            prompt: build_prompt(query, sources),
            system_prompt: SYSTEM_PROMPT.to_string(),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }

    fn generator(&self) -> Result<&Arc<dyn GenerationProvider>> {
        self.generator.as_ref().ok_or_else(|| {
            RetrievalError::Generation("no generation provider configured".to_string())
        })
    }

    async fn cached_answer(&self, key: &str) -> Option<String> {
        let answer = self.answers.as_ref()?.get(key).await?;
        debug!("Answer cache hit for {key}");
        Some(answer)
    }
}

/// The user prompt for `query` grounded in `sources`.
pub fn build_prompt(query: &str, sources: &[Source]) -> String {
    let context = sources
        .iter()
        .map(|s| format!("{}\n[Source: {}]", s.content, s.source))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!("Context:\n{context}\n\nQuestion: {query}\n\nAnswer:")
}

fn answer_key(request: &GenerationRequest) -> String {
    fingerprint([request.prompt.as_str(), request.system_prompt.as_str()])
}

async fn store_answer(store: Option<&CacheStore<String>>, key: &str, answer: &str) {
    if let Some(store) = store
        && let Err(e) = store.put(key, answer.to_string()).await
    {
        warn!("Failed to cache answer {key}: {e}");
    }
}

fn single(text: String) -> TextStream {
    boxed_stream(futures::stream::once(async move { Ok(text) }))
}
