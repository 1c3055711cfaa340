//! # Retrieval Engine
//!
//! This crate ties the docrag components into one engine:
//!
//! - **Collections**: registered folder trees, each with its own vector index
//! - **Embeddings**: a shared, persisted embedding cache
//! - **Directory Watcher**: incremental index updates on file changes
//! - **Query Orchestrator**: grounded answers with an answer cache
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           RagEngine                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  Collection  │  │    Index     │  │  Directory   │           │
//! │  │   Registry   │  │   Catalog    │  │   Watcher    │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                 │                  │                  │
//! │         └─────────────────┼──────────────────┘                  │
//! │                           ▼                                     │
//! │                   ┌──────────────┐      ┌──────────────┐        │
//! │                   │    Query     │─────▶│  Generation  │        │
//! │                   │ Orchestrator │      │   Provider   │        │
//! │                   └──────────────┘      └──────────────┘        │
//! │                           │                                     │
//! │                           ▼                                     │
//! │                   ┌──────────────┐                              │
//! │                   │ Answer Cache │                              │
//! │                   └──────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docrag_retrieval::{Collection, RagEngine};
//!
//! let engine = RagEngine::builder()
//!     .with_data_dir("~/.local/share/docrag")
//!     .build()
//!     .await?;
//!
//! engine.register_collection(Collection::new("notes", "~/Notes")).await?;
//! engine.index_collection("notes").await?;
//! engine.start().await?;
//!
//! let answer = engine.answer("What projects am I working on?", None, None).await?;
//! ```

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod orchestrator;

pub use catalog::IndexCatalog;
pub use config::RagConfig;
pub use engine::{EngineStats, RagEngine, RagEngineBuilder};
pub use error::{Result, RetrievalError};
pub use generation::{GenerationProvider, GenerationRequest, OpenAIChatProvider, TextStream};
pub use orchestrator::{
    Answer, AnswerStream, GenerationSettings, NO_RESULTS_ANSWER, QueryOrchestrator, SYSTEM_PROMPT,
    Source,
};

// Re-export from dependencies for convenience
pub use docrag_directory_watcher::{Collection, IndexReport, WatchMode};
pub use docrag_embeddings::{EmbeddingProvider, HashingProvider, OpenAIProvider};
