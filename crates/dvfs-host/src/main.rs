//! dvfs host: mounts a base folder through FUSE, watches it for direct
//! changes, and runs maintenance commands against the shared metadata store.

#[cfg(feature = "fuse")]
mod adapter;
#[cfg(any(feature = "fuse", test))]
mod inodes;
mod seed;
mod watch;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dvfs_core::{DvfsConfig, LocalDiskStorage, Reconciler};
use dvfs_local_db::Database;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dvfs", author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite metadata database (overrides the configuration file)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Shortcut for --log-level debug
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mount the base folder through FUSE
    Mount {
        /// Folder holding the file bytes
        base: PathBuf,

        /// Mount point for the filesystem
        mount_point: PathBuf,

        /// Allow other users to access the filesystem
        #[arg(long)]
        allow_other: bool,

        /// Allow root to access the filesystem
        #[arg(long)]
        allow_root: bool,

        /// Auto unmount on process exit
        #[arg(long)]
        auto_unmount: bool,
    },
    /// Watch the base folder and reconcile direct changes into the store
    Watch { base: PathBuf },
    /// Bring the store in line with the base folder once
    Resync {
        base: PathBuf,

        /// Subtree to resync
        #[arg(long, default_value = "/")]
        path: String,
    },
    /// Write sample files into the base folder
    Seed { base: PathBuf },
}

fn load_config(config_path: Option<&Path>) -> Result<DvfsConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let config: DvfsConfig = serde_json::from_str(&content)
                .with_context(|| format!("invalid config {}", path.display()))?;
            Ok(config)
        }
        None => Ok(DvfsConfig::default()),
    }
}

fn log_level(name: &str, debug: bool) -> tracing::Level {
    if debug {
        return tracing::Level::DEBUG;
    }
    match name {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

fn open_database(cli_path: Option<&Path>, config: &DvfsConfig) -> Result<Arc<Database>> {
    let path = match cli_path.or(config.database.as_deref()) {
        Some(path) => path.to_path_buf(),
        None => Database::default_path()?,
    };
    info!("Metadata store: {}", path.display());
    let db = Database::open(&path)
        .with_context(|| format!("failed to open metadata store {}", path.display()))?;
    Ok(Arc::new(db))
}

fn base_storage(base: &Path) -> Result<Arc<LocalDiskStorage>> {
    if !base.is_dir() {
        bail!("base folder {} does not exist", base.display());
    }
    Ok(Arc::new(LocalDiskStorage::new(base)))
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let database = cli.database.as_deref();

    match cli.command {
        Command::Mount {
            base,
            mount_point,
            allow_other,
            allow_root,
            auto_unmount,
        } => {
            let store = open_database(database, &config)?;
            let storage = base_storage(&base)?;
            info!("Mount point: {}", mount_point.display());

            #[cfg(feature = "fuse")]
            {
                let dispatcher = dvfs_core::Dispatcher::new(config, store, storage)?;
                let filesystem = adapter::DvfsFuse::new(dispatcher);

                let mut mount_options = vec![
                    fuser::MountOption::FSName("dvfs".to_string()),
                    fuser::MountOption::Subtype("dvfs".to_string()),
                ];
                if allow_other {
                    mount_options.push(fuser::MountOption::AllowOther);
                }
                if allow_root {
                    mount_options.push(fuser::MountOption::AllowRoot);
                }
                if auto_unmount {
                    mount_options.push(fuser::MountOption::AutoUnmount);
                }

                info!("Mounting filesystem...");
                fuser::mount2(filesystem, &mount_point, &mount_options)?;
            }

            #[cfg(not(feature = "fuse"))]
            {
                let _ = (store, storage, allow_other, allow_root, auto_unmount);
                warn!("FUSE support not compiled in; rebuild with --features fuse to mount");
            }
            Ok(())
        }
        Command::Watch { base } => {
            let store = open_database(database, &config)?;
            let storage = base_storage(&base)?;
            let recursive = config.watch.recursive;
            let resync_on_start = config.watch.resync_on_start;
            let reconciler = Reconciler::new(config, store, storage)?;

            let watcher = watch::FolderWatcher::new(&base, recursive)?;
            if resync_on_start {
                let summary = reconciler.resync("/")?;
                info!("Start-up resync of {}: {:?}", watcher.root().display(), summary);
            }
            watcher.run(&reconciler);
            Ok(())
        }
        Command::Resync { base, path } => {
            let store = open_database(database, &config)?;
            let storage = base_storage(&base)?;
            let reconciler = Reconciler::new(config, store, storage)?;
            let summary = reconciler.resync(&path)?;
            if summary.failed > 0 {
                warn!("{} entries could not be reconciled", summary.failed);
            }
            println!(
                "inserted {}, updated {}, removed {}, failed {}",
                summary.inserted, summary.updated, summary.removed, summary.failed
            );
            Ok(())
        }
        Command::Seed { base } => {
            seed::seed(&base)?;
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(log_level(&cli.log_level, cli.debug))
        .init();

    info!("Starting dvfs {:?}", cli.command);
    run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvfs_core::MetadataStore;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_config_loading_default() {
        let config = load_config(None).unwrap();
        assert!(config.enable_xattrs);
        assert_eq!(config.conflict_retries, 1);
    }

    #[test]
    fn test_config_loading_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_json = r#"{
            "conflict_retries": 4,
            "cache": { "attr_ttl_ms": 500, "entry_ttl_ms": 250 },
            "enable_xattrs": false,
            "database": "/tmp/dvfs-test.db"
        }"#;
        temp_file.write_all(config_json.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = load_config(Some(temp_file.path())).unwrap();
        assert_eq!(config.conflict_retries, 4);
        assert_eq!(config.cache.attr_ttl_ms, 500);
        assert_eq!(config.cache.entry_ttl_ms, 250);
        assert!(!config.enable_xattrs);
        assert!(config.watch.resync_on_start);
        assert_eq!(config.database, Some(PathBuf::from("/tmp/dvfs-test.db")));
    }

    #[test]
    fn test_log_level() {
        assert_eq!(log_level("warn", false), tracing::Level::WARN);
        assert_eq!(log_level("warn", true), tracing::Level::DEBUG);
        assert_eq!(log_level("bogus", false), tracing::Level::INFO);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["dvfs", "resync", "/base", "--database", "/tmp/x.db", "-d"])
                .unwrap();
        assert!(cli.debug);
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(cli.command, Command::Resync { ref path, .. } if path == "/"));
    }

    #[test]
    fn test_seed_then_resync_fills_store() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let db_path = dir.path().join("state.db");
        let args = |cmd: &str| {
            Cli::try_parse_from([
                "dvfs",
                cmd,
                base.to_str().unwrap(),
                "--database",
                db_path.to_str().unwrap(),
            ])
            .unwrap()
        };

        run(args("seed")).unwrap();
        run(args("resync")).unwrap();

        let db = Database::open(&db_path).unwrap();
        assert_eq!(db.count().unwrap(), 3);
        let record = db.get("/test1.txt").unwrap().unwrap();
        assert_eq!(record.size(), "Test 1's content".len() as u64);
    }

    #[test]
    fn test_missing_base_folder_is_an_error() {
        let dir = tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "dvfs",
            "resync",
            dir.path().join("missing").to_str().unwrap(),
            "--database",
            dir.path().join("state.db").to_str().unwrap(),
        ])
        .unwrap();
        assert!(run(cli).is_err());
    }
}
