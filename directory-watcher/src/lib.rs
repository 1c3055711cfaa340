//! # Directory Watcher
//!
//! Collection records and their registry, filesystem watching with per-path
//! debouncing, and the indexing pipeline that keeps each collection's vector
//! index in sync with its folder.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Directory Watcher                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  notify ──► FileEvent ──► mpsc ──► Debouncer ──► ChangeHandler  │
//! │                                                      │          │
//! │                                                      ▼          │
//! │  CollectionRegistry ◄── CollectionIndexer ──► VectorIndex       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod debounce;
pub mod error;
pub mod event;
pub mod indexer;
pub mod registry;
pub mod watcher;

pub use config::{Collection, WatchMode};
pub use debounce::{DebounceState, Debouncer};
pub use error::{Result, WatcherError};
pub use event::{FileEvent, FileEventKind};
pub use indexer::{CollectionIndexer, IndexReport};
pub use registry::CollectionRegistry;
pub use watcher::{ChangeHandler, CollectionWatcher, DirectoryWatcher, WatchOptions};
