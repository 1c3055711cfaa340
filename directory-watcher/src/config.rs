//! Collection records.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

/// A named document folder that is indexed as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    /// Unique collection name.
    pub name: String,

    /// Root directory of the collection.
    #[serde(rename = "path")]
    pub root_path: PathBuf,

    /// File extensions (lowercase, without dot) that are indexed.
    #[serde(default = "default_extensions")]
    pub included_extensions: BTreeSet<String>,

    /// Whether the collection is searched and watched.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// When the last full index completed.
    #[serde(default)]
    pub last_indexed: Option<DateTime<Utc>>,

    /// Number of chunks currently indexed.
    #[serde(default)]
    pub chunk_count: usize,

    /// Patterns to exclude (glob patterns).
    #[serde(default = "default_excludes")]
    pub exclude_patterns: Vec<String>,

    /// How changes are picked up.
    #[serde(default)]
    pub watch_mode: WatchMode,
}

impl Collection {
    /// Create a new collection record.
    pub fn new(name: impl Into<String>, root_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root_path: root_path.into(),
            included_extensions: default_extensions(),
            enabled: true,
            last_indexed: None,
            chunk_count: 0,
            exclude_patterns: default_excludes(),
            watch_mode: WatchMode::Realtime,
        }
    }

    /// Replace the included extensions.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.included_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    /// Set the watch mode.
    pub fn with_mode(mut self, mode: WatchMode) -> Self {
        self.watch_mode = mode;
        self
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Disable the collection.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether the collection should have a live watcher.
    pub fn is_watched(&self) -> bool {
        self.enabled && self.watch_mode == WatchMode::Realtime
    }

    /// Check if a path should be excluded.
    ///
    /// Patterns are matched against the path relative to the collection
    /// root, `/`-separated.
    pub fn should_exclude(&self, path: &Path) -> bool {
        let Some(relative) = self.relative_path(path) else {
            return true;
        };

        self.exclude_patterns.iter().any(|pattern| {
            let pattern = pattern.strip_prefix("**/").unwrap_or(pattern);
            let matcher = WildMatch::new(pattern);
            // `**/x/**` style patterns match at any depth.
            matcher.matches(&relative)
                || matcher.matches(&format!("{relative}/"))
                || relative
                    .match_indices('/')
                    .any(|(i, _)| matcher.matches(&relative[i + 1..]))
        })
    }

    /// Whether a file has one of the included extensions.
    pub fn includes(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.included_extensions.contains(&e.to_lowercase()))
    }

    /// Whether a file belongs to the indexed set of this collection.
    pub fn accepts(&self, path: &Path) -> bool {
        self.includes(path) && !self.should_exclude(path)
    }

    /// Path relative to the root, `/`-separated. `None` outside the root.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root_path).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }
}

fn default_enabled() -> bool {
    true
}

fn default_extensions() -> BTreeSet<String> {
    BTreeSet::from(["md".to_string()])
}

/// Get default exclude patterns.
fn default_excludes() -> Vec<String> {
    [
        // Version control
        "**/.git/**",
        "**/.svn/**",
        "**/.hg/**",
        // Dependencies
        "**/node_modules/**",
        "**/target/**",
        "**/.venv/**",
        // Build artifacts
        "**/build/**",
        "**/dist/**",
        // IDE/Editor
        "**/.idea/**",
        "**/.vscode/**",
        "**/*.swp",
        "**/*~",
        // System files
        "**/.DS_Store",
        // Temporary files
        "**/*.tmp",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// How to watch a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Watch for changes in real-time.
    #[default]
    Realtime,

    /// Manual indexing only.
    Manual,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_collection_creation() {
        let collection = Collection::new("notes", "/home/user/notes")
            .with_extensions([".MD", "txt"])
            .with_mode(WatchMode::Manual);

        assert_eq!(collection.root_path, Path::new("/home/user/notes"));
        assert_eq!(
            collection.included_extensions,
            BTreeSet::from(["md".to_string(), "txt".to_string()])
        );
        assert!(!collection.is_watched());
        assert!(Collection::new("a", "/a").is_watched());
        assert!(!Collection::new("a", "/a").disabled().is_watched());
    }

    #[test]
    fn test_exclude_patterns() {
        let collection = Collection::new("test", "/test");

        assert!(collection.should_exclude(Path::new("/test/.git/config")));
        assert!(collection.should_exclude(Path::new("/test/docs/node_modules/pkg/readme.md")));
        assert!(collection.should_exclude(Path::new("/test/notes.md~")));
        assert!(collection.should_exclude(Path::new("/elsewhere/a.md")));
        assert!(!collection.should_exclude(Path::new("/test/src/guide.md")));
        assert!(!collection.should_exclude(Path::new("/test/builder/guide.md")));
    }

    #[test]
    fn test_includes_by_extension() {
        let collection = Collection::new("test", "/test");
        assert!(collection.includes(Path::new("/test/a.md")));
        assert!(collection.includes(Path::new("/test/A.MD")));
        assert!(!collection.includes(Path::new("/test/a.txt")));
        assert!(!collection.includes(Path::new("/test/README")));
        assert!(collection.accepts(Path::new("/test/docs/a.md")));
        assert!(!collection.accepts(Path::new("/test/dist/a.md")));
    }

    #[test]
    fn test_relative_path() {
        let collection = Collection::new("test", "/test");
        assert_eq!(
            collection.relative_path(Path::new("/test/docs/a.md")),
            Some("docs/a.md".to_string())
        );
        assert_eq!(collection.relative_path(Path::new("/test")), None);
        assert_eq!(collection.relative_path(Path::new("/other/a.md")), None);
    }

    #[test]
    fn test_record_defaults_when_fields_missing() {
        let collection: Collection =
            serde_json::from_str(r#"{"name": "n", "path": "/n"}"#).unwrap();
        assert_eq!(collection, Collection::new("n", "/n"));
    }
}
