//! Where stackwright keeps its own state: the user config repo, the image
//! index and scratch space.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use toml::{Table, Value};
use tracing::{debug, info};

use crate::repo::{REPO_DOCUMENT, RepoLocation, RepoManager};

pub const HOME_ENV: &str = "STACKWRIGHT_HOME";
pub const DEFAULTS_URL: &str = "pkg://defaults";
const APP_DIR: &str = "stackwright";

#[derive(Debug, Clone)]
pub struct Settings {
    config_dir: PathBuf,
}

impl Settings {
    /// Config dir priority: explicit flag, then `STACKWRIGHT_HOME`, then the
    /// platform config dir.
    pub fn resolve(flag: Option<&Path>) -> Result<Self> {
        if let Some(dir) = flag {
            return Ok(Self::at(dir));
        }
        if let Ok(dir) = env::var(HOME_ENV)
            && !dir.is_empty()
        {
            return Ok(Self::at(dir));
        }
        let base = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine a config directory; set {HOME_ENV}"))?;
        Ok(Self::at(base.join(APP_DIR)))
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn user_document(&self) -> PathBuf {
        self.config_dir.join(REPO_DOCUMENT)
    }

    pub fn database_path(&self) -> PathBuf {
        self.config_dir.join("index.json")
    }

    pub fn selection_path(&self) -> PathBuf {
        self.config_dir.join("selection.toml")
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.config_dir.join("scratch")
    }

    /// Packaged defaults, then the user repo and everything it references.
    pub fn load_repos(&self) -> Result<RepoManager> {
        let mut repos = RepoManager::new();
        repos.add_repo(DEFAULTS_URL)?;
        repos
            .add_repo(&self.config_dir.display().to_string())
            .with_context(|| format!("Loading user repo {}", self.config_dir.display()))?;
        debug!(repos = repos.repos().len(), "Repos loaded");
        Ok(repos)
    }

    fn read_user_document(&self) -> Result<Table> {
        let path = self.user_document();
        if !path.is_file() {
            let mut table = Table::new();
            let mut repo = Table::new();
            repo.insert("kind".into(), Value::String("preferences".into()));
            table.insert("repo".into(), Value::Table(repo));
            return Ok(table);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn write_user_document(&self, table: &Table) -> Result<()> {
        fs::create_dir_all(&self.config_dir).with_context(|| {
            format!("Failed to create directory: {}", self.config_dir.display())
        })?;
        let path = self.user_document();
        let rendered = toml::to_string_pretty(table).context("Failed to serialize user repo")?;
        fs::write(&path, rendered).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Urls referenced from the user repo, in order.
    pub fn repo_refs(&self) -> Result<Vec<String>> {
        let table = self.read_user_document()?;
        Ok(ref_entries(&table)
            .iter()
            .filter_map(ref_url)
            .map(|reference| RepoLocation::parse(&reference).url())
            .collect())
    }

    /// Adds `url` to the user repo. Returns false when already present.
    pub fn add_repo_ref(&self, url: &str) -> Result<bool> {
        let canonical = canonical_url(url)?;
        let mut table = self.read_user_document()?;
        let mut entries = ref_entries(&table);
        if entries
            .iter()
            .filter_map(ref_url)
            .any(|existing| RepoLocation::parse(&existing).url() == canonical)
        {
            return Ok(false);
        }
        let mut entry = Table::new();
        entry.insert("url".into(), Value::String(canonical.clone()));
        entries.push(Value::Table(entry));
        table.insert("repo-ref".into(), Value::Array(entries));
        self.write_user_document(&table)?;
        info!(repo = %canonical, "Repo reference added");
        Ok(true)
    }

    /// Removes `url` from the user repo. Returns false when it was not there.
    pub fn remove_repo_ref(&self, url: &str) -> Result<bool> {
        let canonical = canonical_url(url)?;
        let mut table = self.read_user_document()?;
        let mut entries = ref_entries(&table);
        let before = entries.len();
        entries.retain(|entry| {
            ref_url(entry).map(|existing| RepoLocation::parse(&existing).url())
                != Some(canonical.clone())
        });
        if entries.len() == before {
            return Ok(false);
        }
        table.insert("repo-ref".into(), Value::Array(entries));
        self.write_user_document(&table)?;
        info!(repo = %canonical, "Repo reference removed");
        Ok(true)
    }
}

fn ref_entries(table: &Table) -> Vec<Value> {
    table
        .get("repo-ref")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn ref_url(entry: &Value) -> Option<String> {
    entry
        .get("url")
        .or_else(|| entry.get("dir"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Absolute url for `url`. Relative local paths resolve against the current
/// directory.
pub fn canonical_url(url: &str) -> Result<String> {
    match RepoLocation::parse(url) {
        RepoLocation::Local(path) if !path.is_absolute() => {
            let cwd = env::current_dir().context("Failed to read current directory")?;
            Ok(RepoLocation::Local(cwd.join(path)).url())
        }
        location => Ok(location.url()),
    }
}
