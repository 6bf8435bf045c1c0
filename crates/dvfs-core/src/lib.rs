//! dvfs core: a hierarchical filesystem view kept as path-keyed metadata
//! records in a shared store, with file bytes held in a local folder.
//!
//! The [`Dispatcher`] serves filesystem operations, the [`Reconciler`]
//! folds changes made directly to the local folder back into the store.
//! Both write through the same [`PathIndex`] with optimistic concurrency
//! on per-record revisions.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod index;
pub mod links;
pub mod local;
pub mod paths;
pub mod reconcile;
pub mod record;
pub mod store;

pub use config::{CachePolicy, DvfsConfig, WatchPolicy};
pub use dispatch::Dispatcher;
pub use error::{FsError, FsResult};
pub use index::PathIndex;
pub use links::LinkCountMaintainer;
pub use local::{content_hash, ByteStorage, ContentStat, LocalDiskStorage};
pub use reconcile::{ChangeEvent, Outcome, Reconciler, ResyncSummary};
pub use record::{Attributes, DirEntry, EntryKind, FsStats, Record, RecordKind, Revision};
pub use store::{InMemoryStore, MetadataStore};
