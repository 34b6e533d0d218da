//! Filesystem watching.
//!
//! notify delivers raw events on its own thread; they are translated into
//! [`FsEvent`]s and forwarded over an unbounded tokio channel.

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// What the indexer reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// Maps one notify event to zero or more [`FsEvent`]s.
pub fn translate(event: &Event) -> Vec<FsEvent> {
    let paths = &event.paths;
    let each = |f: fn(PathBuf) -> FsEvent| -> Vec<FsEvent> { paths.iter().cloned().map(f).collect() };

    match event.kind {
        EventKind::Create(_) => each(FsEvent::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            vec![FsEvent::Renamed {
                from: paths[0].clone(),
                to: paths[1].clone(),
            }]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(FsEvent::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(FsEvent::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Vec::new(),
        EventKind::Modify(_) => each(FsEvent::Modified),
        // inotify reports the end of a write as a close.
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => each(FsEvent::Modified),
        EventKind::Remove(_) => each(FsEvent::Removed),
        _ => Vec::new(),
    }
}

/// Starts a recursive watch on `root`.
///
/// The returned watcher must be kept alive for events to keep flowing.
pub fn watch_tree(
    root: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<FsEvent>), notify::Error> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                trace!(?event, "Filesystem event");
                for fs_event in translate(&event) {
                    if tx.send(fs_event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => error!(error = %e, "Filesystem watcher error"),
        },
        Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}
