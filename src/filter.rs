//! Relevance filtering of raw filesystem events.
//!
//! An event survives when its path carries a watched extension, is not a
//! temporary file, is not covered by an ignore rule and, for content events,
//! the file's modification time actually moved since it was last seen.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use notify::event::{EventKind as NotifyKind, ModifyKind};
use regex::Regex;
use tracing::{error, info};

/// Kind of a filesystem event, reduced to what the filter cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Write,
    Create,
    Remove,
    Rename,
    Chmod,
}

impl EventKind {
    /// Maps a `notify` event kind; access events carry no change and map to `None`.
    pub fn from_notify(kind: &NotifyKind) -> Option<Self> {
        match kind {
            NotifyKind::Access(_) => None,
            NotifyKind::Create(_) => Some(Self::Create),
            NotifyKind::Remove(_) => Some(Self::Remove),
            NotifyKind::Modify(ModifyKind::Name(_)) => Some(Self::Rename),
            NotifyKind::Modify(ModifyKind::Metadata(_)) => Some(Self::Chmod),
            NotifyKind::Modify(_) | NotifyKind::Any | NotifyKind::Other => Some(Self::Write),
        }
    }

    /// Whether the file may still exist with content worth checking.
    fn has_content(self) -> bool {
        !matches!(self, Self::Remove | Self::Rename)
    }
}

/// A single filesystem event for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: EventKind,
}

impl FsEvent {
    pub fn new(path: impl Into<PathBuf>, kind: EventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Expands a `notify` event into one event per affected path.
    pub fn from_notify(event: notify::Event) -> Vec<Self> {
        let Some(kind) = EventKind::from_notify(&event.kind) else {
            return Vec::new();
        };
        event
            .paths
            .into_iter()
            .map(|path| Self::new(path, kind))
            .collect()
    }
}

/// Static filtering rules.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    /// Suffixes a path must end with, e.g. `.rs`.
    pub extensions: Vec<String>,
    /// Substrings that mark a directory as ignored.
    pub ignore_dirs: Vec<String>,
    /// Patterns matched against the full file path.
    pub ignore_files: Vec<Regex>,
    /// Watched roots. Directory rules only look below these.
    pub roots: Vec<PathBuf>,
}

impl WatchFilter {
    fn has_watched_ext(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    // Shortest path of `path` below any watched root.
    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        self.roots
            .iter()
            .filter_map(|root| path.strip_prefix(root).ok())
            .min_by_key(|relative| relative.as_os_str().len())
            .unwrap_or(path)
    }

    fn is_ignored(&self, path: &Path, name: &str) -> bool {
        let in_ignored_dir = self.relative(path).parent().is_some_and(|dir| {
            let dir = dir.to_string_lossy();
            self.ignore_dirs
                .iter()
                .any(|ignored| dir.contains(ignored.as_str()))
        });
        in_ignored_dir || self.ignore_files.iter().any(|re| re.is_match(name))
    }
}

/// Returns true for editor swap files ending in `.tmp`, in any case.
pub fn is_tmp_file(name: &str) -> bool {
    name.to_lowercase().ends_with(".tmp")
}

/// Stateful event filter owning the modification-time cache.
#[derive(Debug)]
pub struct EventFilter {
    rules: WatchFilter,
    mtimes: HashMap<PathBuf, SystemTime>,
}

impl EventFilter {
    pub fn new(rules: WatchFilter) -> Self {
        Self {
            rules,
            mtimes: HashMap::new(),
        }
    }

    /// Decides whether `event` should trigger a run.
    pub fn accept(&mut self, event: &FsEvent) -> bool {
        let name = event.path.to_string_lossy();
        if is_tmp_file(&name)
            || !self.rules.has_watched_ext(&name)
            || self.rules.is_ignored(&event.path, &name)
        {
            return false;
        }
        if !event.kind.has_content() {
            return true;
        }

        let modified = match std::fs::metadata(&event.path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                error!(
                    "failed to get modification time of {}: {}",
                    event.path.display(),
                    err
                );
                return false;
            }
        };
        if self.mtimes.insert(event.path.clone(), modified) == Some(modified) {
            info!("skipped {}", event.path.display());
            return false;
        }
        true
    }
}
