//! Resolution of the directories to watch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use tracing::debug;

use crate::config::Settings;

/// Builds the ordered watch set: the working directory, the configured
/// directories and, when enabled, every non-ignored subdirectory of them.
pub fn resolve_watch_set(settings: &Settings) -> Result<Vec<PathBuf>> {
    let mut dirs = vec![settings.workdir.clone()];
    dirs.extend(settings.watch_dirs.iter().cloned());
    if settings.sub_directories {
        for root in &settings.watch_dirs {
            dirs.extend(sub_directories(
                root,
                settings.symlinks,
                &settings.filter.ignore_dirs,
            )?);
        }
    }

    let mut seen = HashSet::new();
    dirs.retain(|dir| seen.insert(dir.clone()));
    for dir in &dirs {
        debug!("watching {}", dir.display());
    }
    Ok(dirs)
}

fn sub_directories(
    root: &Path,
    follow_links: bool,
    ignore_dirs: &[String],
) -> Result<Vec<PathBuf>> {
    let base = root.to_path_buf();
    let ignored = ignore_dirs.to_vec();
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(follow_links)
        .filter_entry(move |entry| !is_ignored_dir(&base, entry.path(), &ignored))
        .build();

    let mut found = Vec::new();
    for entry in walker {
        let entry = entry
            .with_context(|| format!("failed to get sub-directories of {}", root.display()))?;
        if entry.depth() == 0 || !entry.file_type().is_some_and(|kind| kind.is_dir()) {
            continue;
        }
        found.push(entry.into_path());
    }
    Ok(found)
}

fn is_ignored_dir(root: &Path, path: &Path, ignored: &[String]) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path).to_string_lossy();
    ignored.iter().any(|dir| relative.contains(dir.as_str()))
}
