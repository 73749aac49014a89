use std::path::Path;

use anyhow::{Context, Result};
use glob::glob;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::database::{Database, add_image};
use crate::fits::{is_fits_path, read_header};
use crate::repo::Repo;
use crate::session::ImageRecord;

/// Repo kinds that never hold images.
const CONFIG_ONLY_KINDS: &[&str] = &["recipe", "recipe-index", "preferences"];

#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexReport {
    pub scanned: usize,
    pub added: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub fn holds_images(repo: &Repo) -> bool {
    repo.base_path().is_some()
        && !repo
            .kind()
            .map(|kind| CONFIG_ONLY_KINDS.contains(&kind))
            .unwrap_or(false)
}

/// Reads the header of every FITS file under `repo` into `db`. Without
/// `force`, images already known are left alone.
pub fn reindex_repo(repo: &Repo, db: &mut dyn Database, force: bool) -> Result<IndexReport> {
    let mut report = IndexReport::default();
    let Some(base) = repo.base_path().filter(|_| holds_images(repo)) else {
        debug!(repo = %repo.url(), "Repo holds no images; skipping index");
        return Ok(report);
    };
    if force {
        db.remove_repo(repo.url())?;
    }

    let pattern = base.join("**").join("*");
    let pattern = pattern.to_string_lossy();
    let entries =
        glob(&pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
    for entry in entries {
        let path = entry?;
        if !path.is_file() || !is_fits_path(&path) {
            continue;
        }
        report.scanned += 1;
        let relative = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
        if db.get_image(repo.url(), &relative)?.is_some() {
            report.unchanged += 1;
            continue;
        }
        match index_file(repo, base, &relative, db) {
            Ok(()) => report.added += 1,
            Err(err) => {
                warn!(file = %path.display(), "Failed to index image: {err:#}");
                report.failed += 1;
            }
        }
    }
    info!(
        repo = %repo.url(),
        scanned = report.scanned,
        added = report.added,
        failed = report.failed,
        "Repo indexed"
    );
    Ok(report)
}

fn index_file(repo: &Repo, base: &Path, relative: &Path, db: &mut dyn Database) -> Result<()> {
    let metadata = read_header(&base.join(relative))?;
    add_image(db, ImageRecord::new(repo.url(), relative, metadata))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;
    use crate::fits::write_header;
    use crate::session::keys;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn indexes_fits_files_and_builds_sessions() {
        let temp = tempdir().unwrap();
        let night = temp.path().join("M31").join("2025-01-01");
        fs::create_dir_all(&night).unwrap();
        for (i, hour) in ["20", "21", "22"].iter().enumerate() {
            write_header(
                &night.join(format!("light_{i}.fits")),
                &BTreeMap::from([
                    (keys::IMAGETYP.to_string(), "Light Frame".to_string()),
                    (keys::OBJECT.to_string(), "M31".to_string()),
                    (keys::FILTER.to_string(), "L".to_string()),
                    (keys::DATE_OBS.to_string(), format!("2025-01-01T{hour}:00:00")),
                    (keys::EXPTIME.to_string(), "60".to_string()),
                ]),
            )
            .unwrap();
        }
        fs::write(night.join("notes.txt"), "ignored").unwrap();

        let repo = Repo::load(temp.path().to_str().unwrap()).unwrap();
        let mut db = MemoryDatabase::new();
        let report = reindex_repo(&repo, &mut db, false).unwrap();
        assert_eq!(report.added, 3);
        assert_eq!(report.failed, 0);

        let again = reindex_repo(&repo, &mut db, false).unwrap();
        assert_eq!(again.unchanged, 3);

        let sessions = db.search_session(None).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].num_images, 3);
        assert_eq!(sessions[0].exptime_total, 180.0);
    }
}
