//! Filesystem watcher feeding the reconciler.
//!
//! Raw `notify` events are translated into [`ChangeEvent`]s with store paths
//! relative to the watched folder, then applied one at a time in arrival
//! order.

use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;

use dvfs_core::{ChangeEvent, EntryKind, Reconciler};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create watcher: {0}")]
    Watcher(#[from] notify::Error),

    #[error("cannot watch {path}: {source}")]
    Root {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct FolderWatcher {
    // Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Result<Event>>,
    root: PathBuf,
}

impl FolderWatcher {
    pub fn new(root: &Path, recursive: bool) -> Result<Self, WatchError> {
        let root = root.canonicalize().map_err(|source| WatchError::Root {
            path: root.to_path_buf(),
            source,
        })?;
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&root, mode)?;
        info!("Watching {}", root.display());

        Ok(Self {
            _watcher: watcher,
            events: rx,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply events until the watcher shuts down.
    pub fn run(&self, reconciler: &Reconciler) {
        for result in self.events.iter() {
            match result {
                Ok(event) => reconciler.run(translate(&event, &self.root)),
                Err(e) => warn!("Watcher error: {}", e),
            }
        }
        info!("Watcher for {} stopped", self.root.display());
    }
}

/// Map one `notify` event onto change notifications for paths under `root`.
pub fn translate(event: &Event, root: &Path) -> Vec<ChangeEvent> {
    let mut changes = Vec::new();
    match &event.kind {
        EventKind::Access(_) => {}
        EventKind::Create(kind) => {
            for path in &event.paths {
                let kind = match kind {
                    CreateKind::File => Some(EntryKind::File),
                    CreateKind::Folder => Some(EntryKind::Directory),
                    _ => live_kind(path),
                };
                if let (Some(store_path), Some(kind)) = (store_path(path, root), kind) {
                    changes.push(ChangeEvent::Created {
                        path: store_path,
                        kind,
                    });
                }
            }
        }
        EventKind::Remove(_) => {
            changes.extend(
                event
                    .paths
                    .iter()
                    .filter_map(|p| store_path(p, root))
                    .map(|path| ChangeEvent::Deleted { path }),
            );
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
            (RenameMode::Both, [src, dst]) => {
                match (store_path(src, root), store_path(dst, root)) {
                    (Some(src), Some(dst)) => changes.push(ChangeEvent::Moved { src, dst }),
                    (Some(path), None) => changes.push(ChangeEvent::Deleted { path }),
                    (None, Some(_)) => changes.extend(appeared(dst, root)),
                    (None, None) => {}
                }
            }
            (RenameMode::From, paths) => {
                changes.extend(
                    paths
                        .iter()
                        .filter_map(|p| store_path(p, root))
                        .map(|path| ChangeEvent::Deleted { path }),
                );
            }
            (RenameMode::To, paths) => {
                for path in paths {
                    changes.extend(appeared(path, root));
                }
            }
            (_, paths) => {
                // Direction unknown: decide from what is on disk now.
                for path in paths {
                    match appeared(path, root) {
                        Some(created) => changes.push(created),
                        None => {
                            if let Some(path) = store_path(path, root) {
                                changes.push(ChangeEvent::Deleted { path });
                            }
                        }
                    }
                }
            }
        },
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            changes.extend(
                event
                    .paths
                    .iter()
                    .filter_map(|p| store_path(p, root))
                    .map(|path| ChangeEvent::Modified { path }),
            );
        }
    }
    if !changes.is_empty() {
        debug!("{:?} -> {:?}", event.kind, changes);
    }
    changes
}

fn appeared(path: &Path, root: &Path) -> Option<ChangeEvent> {
    let kind = live_kind(path)?;
    Some(ChangeEvent::Created {
        path: store_path(path, root)?,
        kind,
    })
}

fn live_kind(path: &Path) -> Option<EntryKind> {
    let metadata = std::fs::symlink_metadata(path).ok()?;
    if metadata.is_dir() {
        Some(EntryKind::Directory)
    } else if metadata.is_file() {
        Some(EntryKind::File)
    } else {
        None
    }
}

/// Store path for a host path, or `None` when it lies outside `root` or is
/// not valid UTF-8.
pub fn store_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                out.push('/');
                out.push_str(name.to_str()?);
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Some(out)
}
