//! Per-path debouncing of file change events.
//!
//! Each path is either absent (idle), pending with a timer in a shared
//! [`DelayQueue`], or processing. A repeat event while pending restarts the
//! timer; an event while processing re-arms the path once processing
//! finishes, so it is never dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;

use crate::event::FileEventKind;

/// Debounce state of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// Waiting for the path to settle.
    Pending(FileEventKind),
    /// Being processed; `rearm` holds an event that arrived meanwhile.
    Processing { rearm: Option<FileEventKind> },
}

#[derive(Debug)]
enum Slot {
    Pending { key: Key, kind: FileEventKind },
    Processing { rearm: Option<FileEventKind> },
}

/// Debounces file change events by path.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    timers: DelayQueue<PathBuf>,
    slots: HashMap<PathBuf, Slot>,
}

impl Debouncer {
    /// Create a debouncer firing `delay` after the last event of a path.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timers: DelayQueue::new(),
            slots: HashMap::new(),
        }
    }

    /// Record a file change event.
    ///
    /// The latest event kind wins.
    pub fn record(&mut self, path: PathBuf, kind: FileEventKind) {
        match self.slots.get_mut(&path) {
            Some(Slot::Pending { key, kind: pending }) => {
                self.timers.reset(key, self.delay);
                *pending = kind;
            }
            Some(Slot::Processing { rearm }) => *rearm = Some(kind),
            None => {
                let key = self.timers.insert(path.clone(), self.delay);
                self.slots.insert(path, Slot::Pending { key, kind });
            }
        }
    }

    /// Whether any timer is running.
    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Wait for the next settled path and mark it as processing.
    ///
    /// Resolves to `None` when no timer is running.
    pub async fn next_ready(&mut self) -> Option<(PathBuf, FileEventKind)> {
        while let Some(expired) = self.timers.next().await {
            let path = expired.into_inner();
            if let Some(slot) = self.slots.get_mut(&path)
                && let Slot::Pending { kind, .. } = *slot
            {
                *slot = Slot::Processing { rearm: None };
                return Some((path, kind));
            }
        }
        None
    }

    /// Mark processing of `path` as finished.
    ///
    /// Returns `true` if an event arrived meanwhile and the path is pending
    /// again.
    pub fn finish(&mut self, path: &Path) -> bool {
        match self.slots.remove(path) {
            Some(Slot::Processing { rearm: Some(kind) }) => {
                self.record(path.to_path_buf(), kind);
                true
            }
            Some(Slot::Pending { key, kind }) => {
                self.slots
                    .insert(path.to_path_buf(), Slot::Pending { key, kind });
                false
            }
            _ => false,
        }
    }

    /// Current state of a path. `None` means idle.
    pub fn state(&self, path: &Path) -> Option<DebounceState> {
        self.slots.get(path).map(|slot| match slot {
            Slot::Pending { kind, .. } => DebounceState::Pending(*kind),
            Slot::Processing { rearm } => DebounceState::Processing { rearm: *rearm },
        })
    }

    /// Number of paths pending or processing.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
