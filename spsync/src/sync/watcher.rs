use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Change(PathBuf),
    Unlink(PathBuf),
}

/// Watches `root` recursively. Dropping the returned watcher stops the
/// event stream.
pub fn start_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<FsEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for mapped in map_event(&watch_root, event) {
                let _ = tx.send(mapped);
            }
        }
        Err(err) => warn!(error = %err, "file watcher error"),
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<FsEvent> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
            Vec::new()
        }
        // inotify reports each half of a rename and then a combined event;
        // the halves alone also cover moves into and out of the root.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter(|p| p.starts_with(root))
            .map(FsEvent::Unlink)
            .collect(),
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter(|p| p.starts_with(root) && !p.is_dir())
            .map(FsEvent::Change)
            .collect(),
        _ => Vec::new(),
    }
}
