//! Per-run scratch directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, info, warn};

pub const SCRATCH_PREFIX: &str = "stackwright-run-";

/// A scratch directory shared by the stages of one target run. Removed when
/// dropped.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create scratch root: {}", root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(root)
            .with_context(|| format!("Failed to create scratch dir in {}", root.display()))?;
        debug!(path = %dir.path().display(), "Scratch dir created");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Creates (if needed) and returns a sub directory.
    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
        Ok(path)
    }
}

/// Removes scratch directories under `root` last modified more than
/// `max_age` ago. Returns the removed paths.
pub fn sweep_stale(root: &Path, max_age: Duration) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !root.is_dir() {
        return Ok(removed);
    }
    let now = SystemTime::now();
    for entry in
        fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(SCRATCH_PREFIX) || !entry.path().is_dir() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age < max_age {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed.push(entry.path()),
            Err(err) => warn!(path = %entry.path().display(), "Failed to remove stale scratch dir: {err}"),
        }
    }
    info!(root = %root.display(), removed = removed.len(), "Swept stale scratch dirs");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scratch_dir_is_removed_on_drop() {
        let root = tempdir().unwrap();
        let path = {
            let scratch = ScratchDir::new(root.path()).unwrap();
            scratch.subdir("light").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn sweep_only_touches_scratch_dirs() {
        let root = tempdir().unwrap();
        let leaked = root.path().join(format!("{SCRATCH_PREFIX}abc"));
        fs::create_dir_all(&leaked).unwrap();
        let other = root.path().join("keep-me");
        fs::create_dir_all(&other).unwrap();

        assert!(sweep_stale(root.path(), Duration::from_secs(3600)).unwrap().is_empty());
        let removed = sweep_stale(root.path(), Duration::ZERO).unwrap();
        assert_eq!(removed, vec![leaked.clone()]);
        assert!(!leaked.exists());
        assert!(other.exists());
    }
}
