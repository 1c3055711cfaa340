//! Directory watcher implementation.
//!
//! Each watched collection gets a `notify` watcher whose callback pushes
//! [`FileEvent`]s into a bounded channel, and one consumer task that owns the
//! [`Debouncer`] and hands settled paths to a [`ChangeHandler`]. Different
//! paths are processed concurrently; one path is never processed twice at
//! the same time.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Collection;
use crate::debounce::Debouncer;
use crate::error::Result;
use crate::event::{FileEvent, FileEventKind};

/// Receives settled changes of a collection.
#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    /// Apply the current state of `path` to the index.
    async fn handle_change(&self, path: &Path, kind: FileEventKind) -> Result<()>;
}

/// Watch tuning shared by all collections.
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Quiet period after the last event of a path.
    pub debounce: Duration,

    /// Capacity of the event channel between notify and the consumer.
    pub channel_capacity: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            channel_capacity: 1024,
        }
    }
}

/// A running watcher for one collection.
pub struct CollectionWatcher {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    watcher: Option<RecommendedWatcher>,
}

impl CollectionWatcher {
    /// Start watching the collection root recursively.
    pub fn start(
        collection: &Collection,
        handler: Arc<dyn ChangeHandler>,
        options: WatchOptions,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel(options.channel_capacity.max(1));
        let filter = collection.clone();

        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for file_event in FileEvent::from_notify(event) {
                        if !filter.accepts(&file_event.path)
                            || (file_event.kind != FileEventKind::Deleted
                                && file_event.path.is_dir())
                        {
                            continue;
                        }

                        if let Err(e) = event_tx.blocking_send(file_event) {
                            error!("Failed to send file event: {e}");
                        }
                    }
                }
                Err(e) => {
                    error!("Watch error: {e}");
                }
            },
        )?;
        watcher.watch(&collection.root_path, RecursiveMode::Recursive)?;

        info!(
            "Watching collection {} at {}",
            collection.name,
            collection.root_path.display()
        );

        let mut started = Self::spawn(&collection.name, event_rx, handler, options.debounce);
        started.watcher = Some(watcher);
        Ok(started)
    }

    /// Run the consumer over an externally fed event channel.
    pub fn spawn(
        name: &str,
        events: mpsc::Receiver<FileEvent>,
        handler: Arc<dyn ChangeHandler>,
        debounce: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_consumer(
            name.to_string(),
            events,
            handler,
            Debouncer::new(debounce),
            cancel.clone(),
        ));

        Self {
            name: name.to_string(),
            cancel,
            task,
            watcher: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop watching and wait for in-flight processing to finish.
    pub async fn stop(self) {
        drop(self.watcher);
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Watcher task for {} failed: {e}", self.name);
        }
        info!("Stopped watching collection {}", self.name);
    }
}

async fn run_consumer(
    name: String,
    mut events: mpsc::Receiver<FileEvent>,
    handler: Arc<dyn ChangeHandler>,
    mut debouncer: Debouncer,
    cancel: CancellationToken,
) {
    let mut tasks: JoinSet<PathBuf> = JoinSet::new();
    let mut events_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv(), if events_open => match event {
                Some(event) => {
                    debug!("{name}: {:?} {}", event.kind, event.path.display());
                    debouncer.record(event.path, event.kind);
                }
                None => events_open = false,
            },

            Some((path, kind)) = debouncer.next_ready(), if debouncer.has_timers() => {
                let handler = handler.clone();
                let name = name.clone();
                tasks.spawn(async move {
                    let outcome = AssertUnwindSafe(handler.handle_change(&path, kind))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("{name}: failed to process {}: {e}", path.display()),
                        Err(_) => error!("{name}: processing {} panicked", path.display()),
                    }
                    path
                });
            }

            Some(joined) = tasks.join_next() => match joined {
                Ok(path) => {
                    if debouncer.finish(&path) {
                        debug!("{name}: {} changed during processing", path.display());
                    }
                }
                Err(e) => error!("{name}: processing task failed: {e}"),
            },
        }
    }

    // Let in-flight work land before reporting the watcher as stopped.
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("{name}: processing task failed: {e}");
        }
    }
}

/// Manages one [`CollectionWatcher`] per watched collection.
pub struct DirectoryWatcher {
    options: WatchOptions,
    watchers: Mutex<HashMap<String, CollectionWatcher>>,
}

impl DirectoryWatcher {
    /// Create a new directory watcher.
    pub fn new(options: WatchOptions) -> Self {
        Self {
            options,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching a collection. Does nothing if it is already watched.
    pub async fn watch(
        &self,
        collection: &Collection,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<()> {
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(&collection.name) {
            debug!("Collection {} is already watched", collection.name);
            return Ok(());
        }

        let watcher = CollectionWatcher::start(collection, handler, self.options)?;
        watchers.insert(collection.name.clone(), watcher);
        Ok(())
    }

    /// Stop watching a collection. Returns `false` if it was not watched.
    pub async fn unwatch(&self, name: &str) -> bool {
        let watcher = self.watchers.lock().await.remove(name);
        match watcher {
            Some(watcher) => {
                watcher.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn is_watching(&self, name: &str) -> bool {
        self.watchers.lock().await.contains_key(name)
    }

    /// Names of watched collections, sorted.
    pub async fn watched(&self) -> Vec<String> {
        let mut names: Vec<String> = self.watchers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop all watchers.
    pub async fn stop_all(&self) {
        let watchers: Vec<CollectionWatcher> =
            self.watchers.lock().await.drain().map(|(_, w)| w).collect();
        for watcher in watchers {
            watcher.stop().await;
        }
    }
}

impl Default for DirectoryWatcher {
    fn default() -> Self {
        Self::new(WatchOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::time::sleep;

    /// Records handled changes; optionally slow.
    #[derive(Default)]
    struct Recorder {
        handled: StdMutex<Vec<(PathBuf, FileEventKind)>>,
        work: Duration,
    }

    #[async_trait]
    impl ChangeHandler for Recorder {
        async fn handle_change(&self, path: &Path, kind: FileEventKind) -> Result<()> {
            sleep(self.work).await;
            self.handled
                .lock()
                .unwrap()
                .push((path.to_path_buf(), kind));
            Ok(())
        }
    }

    impl Recorder {
        fn handled(&self) -> Vec<(PathBuf, FileEventKind)> {
            self.handled.lock().unwrap().clone()
        }
    }

    fn event(kind: FileEventKind, path: &str) -> FileEvent {
        FileEvent::new(kind, path)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_processed_once_with_last_kind() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel(16);
        let watcher = CollectionWatcher::spawn("docs", rx, recorder.clone(), Duration::from_secs(1));

        tx.send(event(FileEventKind::Created, "/c/a.md")).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        tx.send(event(FileEventKind::Modified, "/c/a.md")).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        tx.send(event(FileEventKind::Deleted, "/c/a.md")).await.unwrap();

        sleep(Duration::from_millis(900)).await;
        assert!(recorder.handled().is_empty());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(
            recorder.handled(),
            vec![(PathBuf::from("/c/a.md"), FileEventKind::Deleted)]
        );

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_during_processing_is_not_dropped() {
        let recorder = Arc::new(Recorder {
            work: Duration::from_secs(5),
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(16);
        let watcher = CollectionWatcher::spawn("docs", rx, recorder.clone(), Duration::from_secs(1));

        tx.send(event(FileEventKind::Modified, "/c/a.md")).await.unwrap();
        // Processing starts at 1s and runs until 6s.
        sleep(Duration::from_secs(2)).await;
        tx.send(event(FileEventKind::Modified, "/c/a.md")).await.unwrap();

        sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.handled().len(), 1);

        // Re-armed at 6s, settles at 7s, finishes at 12s.
        sleep(Duration::from_secs(6)).await;
        assert_eq!(recorder.handled().len(), 2);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_work() {
        let recorder = Arc::new(Recorder {
            work: Duration::from_secs(3),
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(16);
        let watcher = CollectionWatcher::spawn("docs", rx, recorder.clone(), Duration::from_secs(1));

        tx.send(event(FileEventKind::Modified, "/c/a.md")).await.unwrap();
        sleep(Duration::from_millis(1500)).await;

        watcher.stop().await;
        assert_eq!(recorder.handled().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_watcher_lifecycle() {
        let dir = TempDir::new().unwrap();
        let collection = Collection::new("docs", dir.path());
        let watcher = DirectoryWatcher::default();
        let handler: Arc<dyn ChangeHandler> = Arc::new(Recorder::default());

        watcher.watch(&collection, handler.clone()).await.unwrap();
        watcher.watch(&collection, handler).await.unwrap();
        assert!(watcher.is_watching("docs").await);
        assert_eq!(watcher.watched().await, vec!["docs".to_string()]);

        assert!(watcher.unwatch("docs").await);
        assert!(!watcher.unwatch("docs").await);
        assert!(watcher.watched().await.is_empty());
    }

    #[tokio::test]
    async fn test_watch_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        let collection = Collection::new("docs", dir.path().join("missing"));
        let watcher = DirectoryWatcher::default();

        let result = watcher
            .watch(&collection, Arc::new(Recorder::default()))
            .await;
        assert!(result.is_err());
        assert!(!watcher.is_watching("docs").await);
    }
}
