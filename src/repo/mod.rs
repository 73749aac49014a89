//! Repositories: any TOML-described location contributing configuration,
//! recipes or image data.

pub mod import;
pub mod manager;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use toml::{Table, Value};

use crate::error::ProcessingError;
use crate::resources::packaged_file;

pub use import::ImportResolver;
pub use manager::{MergedConfig, RepoManager, Sourced};

/// File name of the configuration document inside every repo.
pub const REPO_DOCUMENT: &str = "stackwright.toml";

const PACKAGED_SCHEME: &str = "pkg://";
const FILE_SCHEME: &str = "file://";

/// Repo kinds whose images are outputs of earlier processing.
pub const PROCESSED_KINDS: &[&str] = &["master", "processed"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RepoLocation {
    Local(PathBuf),
    Packaged(String),
}

impl RepoLocation {
    pub fn parse(url: &str) -> Self {
        if let Some(name) = url.strip_prefix(PACKAGED_SCHEME) {
            RepoLocation::Packaged(normalize_resource(name))
        } else if let Some(path) = url.strip_prefix(FILE_SCHEME) {
            RepoLocation::Local(PathBuf::from(path))
        } else {
            RepoLocation::Local(PathBuf::from(url))
        }
    }

    pub fn url(&self) -> String {
        match self {
            RepoLocation::Local(path) => format!("{FILE_SCHEME}{}", path.display()),
            RepoLocation::Packaged(name) => format!("{PACKAGED_SCHEME}{name}"),
        }
    }

    /// Resolves `reference` against this location. Absolute urls win.
    pub fn join(&self, reference: &str) -> RepoLocation {
        if reference.contains("://") {
            return RepoLocation::parse(reference);
        }
        match self {
            RepoLocation::Local(base) => {
                let candidate = Path::new(reference);
                if candidate.is_absolute() {
                    RepoLocation::Local(candidate.to_path_buf())
                } else {
                    RepoLocation::Local(base.join(candidate))
                }
            }
            RepoLocation::Packaged(base) => {
                RepoLocation::Packaged(normalize_resource(&format!("{base}/{reference}")))
            }
        }
    }

    /// Reads `file` (relative to this location). `Ok(None)` when it does not exist.
    pub fn read_document(&self, file: &str) -> Result<Option<String>> {
        match self {
            RepoLocation::Local(base) => {
                let path = base.join(file);
                if !path.is_file() {
                    return Ok(None);
                }
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Ok(Some(content))
            }
            RepoLocation::Packaged(base) => {
                let name = normalize_resource(&format!("{base}/{file}"));
                Ok(packaged_file(&name).map(str::to_string))
            }
        }
    }

    pub fn describe(&self, file: &str) -> String {
        match self {
            RepoLocation::Local(base) => base.join(file).display().to_string(),
            RepoLocation::Packaged(base) => {
                format!("{PACKAGED_SCHEME}{}", normalize_resource(&format!("{base}/{file}")))
            }
        }
    }
}

fn normalize_resource(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

#[derive(Debug)]
pub struct Repo {
    location: RepoLocation,
    url: String,
    config: Table,
}

impl Repo {
    /// Loads the repo at `url` with every import resolved. A repo without a
    /// document is valid and has an empty configuration.
    pub fn load(url: &str) -> Result<Self> {
        let location = RepoLocation::parse(url);
        let mut resolver = ImportResolver::new();
        let config = resolver
            .load_document(&location, REPO_DOCUMENT)
            .with_context(|| format!("Failed to load repo {}", location.url()))?;
        Ok(Self {
            url: location.url(),
            location,
            config,
        })
    }

    /// Builds a repo from an already parsed document, resolving its imports
    /// against `url`.
    pub fn from_table(url: &str, config: Table) -> Result<Self> {
        let location = RepoLocation::parse(url);
        let mut resolver = ImportResolver::new();
        let config = resolver.resolve_document(&location, REPO_DOCUMENT, config)?;
        Ok(Self {
            url: location.url(),
            location,
            config,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn location(&self) -> &RepoLocation {
        &self.location
    }

    pub fn config(&self) -> &Table {
        &self.config
    }

    pub fn base_path(&self) -> Option<&Path> {
        match &self.location {
            RepoLocation::Local(path) => Some(path.as_path()),
            RepoLocation::Packaged(_) => None,
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.config, path)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.get_str("repo.kind")
    }

    pub fn is_recipe(&self) -> bool {
        self.kind() == Some("recipe")
    }

    /// Whether the repo holds outputs of earlier processing (masters or
    /// finished images) rather than raw exposures.
    pub fn is_processed_output(&self) -> bool {
        self.kind()
            .map(|kind| PROCESSED_KINDS.contains(&kind))
            .unwrap_or(false)
    }

    /// Output path template for files written into this repo. A table-valued
    /// `repo.relative` is keyed by image type with an optional `default`.
    pub fn relative_template(&self, imagetyp: Option<&str>) -> Option<String> {
        match self.get("repo.relative")? {
            Value::String(template) => Some(template.clone()),
            Value::Table(by_type) => imagetyp
                .and_then(|kind| by_type.get(kind))
                .or_else(|| by_type.get("default"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }

    /// Urls of the repos this one references, resolved against its location.
    pub fn repo_refs(&self) -> Result<Vec<String>> {
        let Some(entries) = self.config.get("repo-ref") else {
            return Ok(Vec::new());
        };
        let entries = entries.as_array().ok_or_else(|| {
            ProcessingError::config(format!("'repo-ref' in {} must be an array of tables", self.url))
        })?;
        let mut urls = Vec::with_capacity(entries.len());
        for entry in entries {
            let reference = entry
                .get("dir")
                .or_else(|| entry.get("url"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProcessingError::config(format!(
                        "'repo-ref' entry in {} needs a 'dir' or 'url'",
                        self.url
                    ))
                })?;
            urls.push(self.location.join(reference).url());
        }
        Ok(urls)
    }

    /// Reads a file shipped alongside the repo document, such as a script.
    pub fn read_file(&self, relative: &str) -> Result<String> {
        self.location.read_document(relative)?.ok_or_else(|| {
            ProcessingError::NotFound(self.location.describe(relative)).into()
        })
    }
}

/// Absolute path of an image stored at `relative` inside the repo at
/// `repo_url`. Images outside any repo carry an empty url and an absolute
/// path.
pub fn resolve_image_path(repo_url: &str, relative: &Path) -> PathBuf {
    match RepoLocation::parse(repo_url) {
        RepoLocation::Local(base) => base.join(relative),
        RepoLocation::Packaged(_) => relative.to_path_buf(),
    }
}

/// Walks a dot separated path through nested tables. Numeric segments index
/// into arrays.
pub fn lookup<'a>(table: &'a Table, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = table.get(first)?;
    for segment in segments {
        current = match current {
            Value::Table(inner) => inner.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn packaged_location_joins_relative_reference() {
        let base = RepoLocation::parse("pkg://recipes");
        assert_eq!(base.join("master").url(), "pkg://recipes/master");
        assert_eq!(base.join("../defaults").url(), "pkg://defaults");
        assert_eq!(base.join("/tmp/x").url(), "pkg://recipes/tmp/x");
    }

    #[test]
    fn missing_document_yields_empty_config() {
        let temp = tempdir().unwrap();
        let repo = Repo::load(temp.path().to_str().unwrap()).unwrap();
        assert!(repo.config().is_empty());
        assert_eq!(repo.kind(), None);
    }

    #[test]
    fn relative_template_prefers_image_type() {
        let table: Table = toml::from_str(
            r#"
            [repo]
            kind = "master"
            [repo.relative]
            default = "{imagetyp}/{date}.fits"
            flat = "{imagetyp}/{filter}/{date}.fits"
            "#,
        )
        .unwrap();
        let repo = Repo::from_table("/data/masters", table).unwrap();
        assert_eq!(
            repo.relative_template(Some("flat")).as_deref(),
            Some("{imagetyp}/{filter}/{date}.fits")
        );
        assert_eq!(
            repo.relative_template(Some("bias")).as_deref(),
            Some("{imagetyp}/{date}.fits")
        );
        assert!(repo.is_processed_output());
    }

    #[test]
    fn repo_refs_resolve_against_base() {
        let table: Table = toml::from_str(
            r#"
            [[repo-ref]]
            dir = "lights"
            [[repo-ref]]
            url = "pkg://recipes"
            "#,
        )
        .unwrap();
        let repo = Repo::from_table("/data", table).unwrap();
        assert_eq!(
            repo.repo_refs().unwrap(),
            vec!["file:///data/lights".to_string(), "pkg://recipes".to_string()]
        );
    }

    #[test]
    fn lookup_walks_tables_and_arrays() {
        let table: Table = toml::from_str(
            r#"
            [[stages]]
            name = "light"
            [recipe.stage.light]
            tool = "siril"
            "#,
        )
        .unwrap();
        assert_eq!(
            lookup(&table, "recipe.stage.light.tool").and_then(Value::as_str),
            Some("siril")
        );
        assert_eq!(
            lookup(&table, "stages.0.name").and_then(Value::as_str),
            Some("light")
        );
        assert!(lookup(&table, "recipe.stage.dark").is_none());
    }
}
