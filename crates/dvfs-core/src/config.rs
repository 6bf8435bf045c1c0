//! Configuration types for the dvfs metadata layer

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Reply TTLs handed to the kernel by the mount adapter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachePolicy {
    pub attr_ttl_ms: u32,
    pub entry_ttl_ms: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
        }
    }
}

/// Watcher behaviour for the reconciling process
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchPolicy {
    pub recursive: bool,
    pub resync_on_start: bool,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            recursive: true,
            resync_on_start: true,
        }
    }
}

/// Main configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DvfsConfig {
    /// Re-read-and-reapply attempts after a revision conflict on a field-level change.
    pub conflict_retries: u32,
    pub cache: CachePolicy,
    pub watch: WatchPolicy,
    pub enable_xattrs: bool,
    pub default_dir_mode: u32,
    pub default_file_mode: u32,
    /// SQLite state database; `None` resolves to the platform default.
    pub database: Option<PathBuf>,
}

impl Default for DvfsConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 1,
            cache: CachePolicy::default(),
            watch: WatchPolicy::default(),
            enable_xattrs: true,
            default_dir_mode: 0o755,
            default_file_mode: 0o644,
            database: None,
        }
    }
}
