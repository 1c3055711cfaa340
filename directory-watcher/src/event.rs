//! File events from directory watching.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use serde::{Deserialize, Serialize};

/// A file system event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// The kind of event.
    pub kind: FileEventKind,

    /// Path to the affected file.
    pub path: PathBuf,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    /// Create a new file event.
    pub fn new(kind: FileEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: Utc::now(),
        }
    }

    /// Translate a notify event into per-path file events.
    ///
    /// Renames become a deletion of the old path and a creation of the new
    /// one. Access and metadata-only events carry no content change and
    /// yield nothing.
    pub fn from_notify(event: notify::Event) -> Vec<Self> {
        use notify::EventKind;

        let kind = match event.kind {
            EventKind::Create(_) => FileEventKind::Created,
            EventKind::Remove(_) => FileEventKind::Deleted,
            EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FileEventKind::Deleted,
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileEventKind::Created,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut paths = event.paths.into_iter();
                return paths
                    .next()
                    .map(|from| Self::new(FileEventKind::Deleted, from))
                    .into_iter()
                    .chain(paths.map(|to| Self::new(FileEventKind::Created, to)))
                    .collect();
            }
            EventKind::Modify(_) => FileEventKind::Modified,
            _ => return Vec::new(),
        };

        event
            .paths
            .into_iter()
            .map(|path| Self::new(kind, path))
            .collect()
    }
}

/// Kind of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    /// File was created.
    Created,

    /// File was modified.
    Modified,

    /// File was deleted.
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind};
    use notify::{Event, EventKind};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn kinds(events: &[FileEvent]) -> Vec<(FileEventKind, &Path)> {
        events.iter().map(|e| (e.kind, e.path.as_path())).collect()
    }

    #[test]
    fn test_create_modify_remove() {
        let created = FileEvent::from_notify(
            Event::new(EventKind::Create(CreateKind::File)).add_path("/c/a.md".into()),
        );
        let modified = FileEvent::from_notify(
            Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path("/c/a.md".into()),
        );
        let removed = FileEvent::from_notify(
            Event::new(EventKind::Remove(RemoveKind::File)).add_path("/c/a.md".into()),
        );

        assert_eq!(kinds(&created), vec![(FileEventKind::Created, Path::new("/c/a.md"))]);
        assert_eq!(kinds(&modified), vec![(FileEventKind::Modified, Path::new("/c/a.md"))]);
        assert_eq!(kinds(&removed), vec![(FileEventKind::Deleted, Path::new("/c/a.md"))]);
    }

    #[test]
    fn test_rename_both_splits_into_delete_and_create() {
        let events = FileEvent::from_notify(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path("/c/old.md".into())
                .add_path("/c/new.md".into()),
        );

        assert_eq!(
            kinds(&events),
            vec![
                (FileEventKind::Deleted, Path::new("/c/old.md")),
                (FileEventKind::Created, Path::new("/c/new.md")),
            ]
        );
    }

    #[test]
    fn test_metadata_and_access_are_ignored() {
        let metadata = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)))
            .add_path("/c/a.md".into());
        let access = Event::new(EventKind::Access(AccessKind::Any)).add_path("/c/a.md".into());

        assert!(FileEvent::from_notify(metadata).is_empty());
        assert!(FileEvent::from_notify(access).is_empty());
    }
}
