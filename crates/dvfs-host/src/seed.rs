//! Sample content for trying out a fresh base folder.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

const SAMPLE_FILES: &[(&str, &str)] = &[
    ("test1.txt", "Test 1's content"),
    ("test2.txt", "Test 2's content"),
];

/// Write the sample files into `base`, overwriting earlier copies.
pub fn seed(base: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(base)
        .with_context(|| format!("failed to create base folder {}", base.display()))?;

    let mut written = Vec::with_capacity(SAMPLE_FILES.len());
    for (name, content) in SAMPLE_FILES {
        let path = base.join(name);
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Seeded {}", path.display());
        written.push(path);
    }
    Ok(written)
}
