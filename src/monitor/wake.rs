//! Early wake-up of the monitor loop on filesystem changes.
//!
//! Parent directories are watched rather than the files themselves so that
//! rotation (a new file appearing under the old name) is noticed as well.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Whether a change to `changed` concerns one of `watched`.
pub fn is_watched(changed: &Path, watched: &[PathBuf]) -> bool {
    watched.iter().any(|path| path == changed)
}

fn watch_dir(file: &Path) -> &Path {
    match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Start a watcher that signals `wake` whenever one of `files` changes.
///
/// The returned watcher must be kept alive for notifications to continue.
/// Directories that do not exist are skipped with a warning.
///
/// # Errors
///
/// Returns an error if the platform watcher cannot be created.
pub fn spawn_change_watcher(
    files: &[PathBuf],
    wake: Arc<Notify>,
) -> anyhow::Result<RecommendedWatcher> {
    // Events are reported under the watched directory, so compare against
    // the same spelling.
    let watched: Vec<PathBuf> = files
        .iter()
        .map(|f| match f.file_name() {
            Some(name) => watch_dir(f).join(name),
            None => f.clone(),
        })
        .collect();

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "file watcher error");
                return;
            }
        };
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        if event.paths.iter().any(|p| is_watched(p, &watched)) {
            debug!(paths = ?event.paths, "watched log changed");
            wake.notify_one();
        }
    })?;

    let dirs: BTreeSet<&Path> = files.iter().map(|f| watch_dir(f)).collect();
    for dir in dirs {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "not watching missing log directory");
            continue;
        }
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
    }

    info!(files = files.len(), "watching log files for changes");
    Ok(watcher)
}
