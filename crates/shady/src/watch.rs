//! Rebuilds the environment whenever one of its source files changes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{after, select, unbounded, Receiver};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use renderer::{CancelToken, EnvironmentSender};
use tracing::{debug, info, warn};

use crate::loader::Loader;

/// Watches the shader at `path` and its includes, publishing a freshly
/// built environment to `sender` at start and after every change.
///
/// A build that fails is logged and skipped; the engine keeps whatever it
/// was rendering. Bursts of events are collapsed: after the first relevant
/// event the watcher keeps draining for `debounce` before rebuilding.
/// Returns once `cancel` fires.
pub fn watch(
    loader: &Loader,
    path: &Path,
    sender: &EnvironmentSender,
    cancel: &CancelToken,
    debounce: Duration,
) -> Result<()> {
    info!(path = %path.display(), "watching shader");
    while !cancel.is_cancelled() {
        // The file set can change between builds, so the watcher is
        // recreated each round and installed before the build reads them.
        let files = watched_files(loader, path);
        let (events, _watcher) = watch_files(&files)?;

        match loader.load(path) {
            Ok(environment) => sender.publish(environment),
            Err(err) => warn!(path = %path.display(), "shader not reloaded: {err}"),
        }

        if !wait_for_change(&events, &files, cancel) {
            break;
        }
        let quiet = after(debounce);
        loop {
            select! {
                recv(events) -> event => {
                    if event.is_err() {
                        break;
                    }
                }
                recv(quiet) -> _ => break,
                recv(cancel.signal()) -> _ => return Ok(()),
            }
        }
        debug!(path = %path.display(), "sources changed, rebuilding");
    }
    Ok(())
}

fn watched_files(loader: &Loader, path: &Path) -> BTreeSet<PathBuf> {
    loader
        .source_files(path)
        .into_iter()
        .map(|file| canonical(&file))
        .collect()
}

/// Canonical form of `file`, tolerating a file that does not exist yet.
fn canonical(file: &Path) -> PathBuf {
    if let Ok(path) = std::fs::canonicalize(file) {
        return path;
    }
    match (file.parent(), file.file_name()) {
        (Some(dir), Some(name)) => {
            let dir = if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            };
            std::fs::canonicalize(dir)
                .map(|dir| dir.join(name))
                .unwrap_or_else(|_| file.to_path_buf())
        }
        _ => file.to_path_buf(),
    }
}

/// Editors often replace files instead of writing them in place, so the
/// parent directories are watched and events filtered by path.
fn watch_files(
    files: &BTreeSet<PathBuf>,
) -> Result<(Receiver<notify::Result<Event>>, RecommendedWatcher)> {
    let (tx, rx) = unbounded();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })
    .context("failed to create file watcher")?;

    let dirs: BTreeSet<&Path> = files.iter().filter_map(|file| file.parent()).collect();
    for dir in dirs {
        if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            warn!(dir = %dir.display(), error = %err, "failed to watch directory");
        }
    }
    Ok((rx, watcher))
}

/// Blocks until an event touches one of `files`. Returns `false` when
/// cancelled or the watcher went away.
fn wait_for_change(
    events: &Receiver<notify::Result<Event>>,
    files: &BTreeSet<PathBuf>,
    cancel: &CancelToken,
) -> bool {
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(Ok(event)) if is_relevant(&event, files) => return true,
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "file watcher error"),
                Err(_) => return false,
            },
            recv(cancel.signal()) -> _ => return false,
        }
    }
}

fn is_relevant(event: &Event, files: &BTreeSet<PathBuf>) -> bool {
    let changes_content = match event.kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any => {
            true
        }
        EventKind::Access(_) | EventKind::Other => false,
    };
    changes_content && event.paths.iter().any(|path| files.contains(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind};

    fn files() -> BTreeSet<PathBuf> {
        BTreeSet::from([PathBuf::from("/shaders/main.glsl")])
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn content_changes_to_watched_files_are_relevant() {
        let files = files();
        assert!(is_relevant(
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/shaders/main.glsl"
            ),
            &files
        ));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::File), "/shaders/main.glsl"),
            &files
        ));
    }

    #[test]
    fn reads_and_unrelated_files_are_ignored() {
        let files = files();
        assert!(!is_relevant(
            &event(EventKind::Access(AccessKind::Any), "/shaders/main.glsl"),
            &files
        ));
        assert!(!is_relevant(
            &event(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)),
                "/shaders/main.glsl"
            ),
            &files
        ));
        assert!(!is_relevant(
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/shaders/other.glsl"
            ),
            &files
        ));
    }
}
