use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use toml::{Table, Value};
use tracing::{debug, info};

use super::{Repo, RepoLocation, lookup};

/// Top-level sections that accumulate across repos instead of overriding.
pub const LIST_SECTIONS: &[&str] = &["stages", "stage", "parameters", "overrides", "repo-ref"];

/// A parsed value together with the repo that declared it.
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    pub value: T,
    pub source: Arc<Repo>,
}

impl<T> Sourced<T> {
    pub fn new(value: T, source: Arc<Repo>) -> Self {
        Self { value, source }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
        }
    }
}

/// Precedence view over an ordered repo list. Built once per change to the
/// list and never mutated afterwards.
#[derive(Debug, Default)]
pub struct MergedConfig {
    scalars: Table,
    lists: BTreeMap<String, Vec<Sourced<Value>>>,
}

impl MergedConfig {
    pub fn build(repos: &[Arc<Repo>]) -> Self {
        let mut scalars = Table::new();
        let mut lists: BTreeMap<String, Vec<Sourced<Value>>> = BTreeMap::new();
        for repo in repos {
            for (key, value) in repo.config() {
                if LIST_SECTIONS.contains(&key.as_str()) {
                    let entries = lists.entry(key.clone()).or_default();
                    match value {
                        Value::Array(items) => entries.extend(
                            items
                                .iter()
                                .map(|item| Sourced::new(item.clone(), repo.clone())),
                        ),
                        other => entries.push(Sourced::new(other.clone(), repo.clone())),
                    }
                } else {
                    merge_value(&mut scalars, key, value);
                }
            }
        }
        Self { scalars, lists }
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        let section = path.split('.').next().unwrap_or(path);
        if LIST_SECTIONS.contains(&section) {
            let items: Vec<Value> = self.list(section).iter().map(|s| s.value.clone()).collect();
            if items.is_empty() {
                return None;
            }
            let array = Value::Array(items);
            if section == path {
                return Some(array);
            }
            let mut wrapper = Table::new();
            wrapper.insert(section.to_string(), array);
            return lookup(&wrapper, path).cloned();
        }
        lookup(&self.scalars, path).cloned()
    }

    pub fn list(&self, section: &str) -> &[Sourced<Value>] {
        self.lists.get(section).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn merge_value(target: &mut Table, key: &str, value: &Value) {
    match (target.get_mut(key), value) {
        (Some(Value::Table(existing)), Value::Table(incoming)) => {
            for (child_key, child) in incoming {
                merge_value(existing, child_key, child);
            }
        }
        _ => {
            target.insert(key.to_string(), value.clone());
        }
    }
}

/// Ordered set of repos. Later repos win scalar lookups; list sections
/// concatenate in load order.
#[derive(Debug, Default)]
pub struct RepoManager {
    repos: Vec<Arc<Repo>>,
    merged: Arc<MergedConfig>,
}

impl RepoManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the repo at `url` then, depth first, every repo it references.
    /// Adding a url twice returns the repo loaded the first time.
    pub fn add_repo(&mut self, url: &str) -> Result<Arc<Repo>> {
        let canonical = RepoLocation::parse(url).url();
        if let Some(existing) = self.repo_by_url(&canonical) {
            debug!(repo = %canonical, "Repo already loaded");
            return Ok(existing);
        }
        let repo = Arc::new(Repo::load(&canonical)?);
        self.push(repo.clone());
        for reference in repo.repo_refs()? {
            self.add_repo(&reference)
                .with_context(|| format!("Repo referenced from {}", repo.url()))?;
        }
        Ok(repo)
    }

    /// Appends an already constructed repo without following its references.
    pub fn add_loaded(&mut self, repo: Repo) -> Arc<Repo> {
        let repo = Arc::new(repo);
        self.push(repo.clone());
        repo
    }

    fn push(&mut self, repo: Arc<Repo>) {
        info!(repo = %repo.url(), kind = repo.kind().unwrap_or("-"), "Repo added");
        self.repos.push(repo);
        self.merged = Arc::new(MergedConfig::build(&self.repos));
    }

    pub fn remove_repo(&mut self, url: &str) -> bool {
        let canonical = RepoLocation::parse(url).url();
        let before = self.repos.len();
        self.repos.retain(|repo| repo.url() != canonical);
        let removed = self.repos.len() != before;
        if removed {
            self.merged = Arc::new(MergedConfig::build(&self.repos));
        }
        removed
    }

    pub fn repos(&self) -> &[Arc<Repo>] {
        &self.repos
    }

    pub fn repo_by_url(&self, url: &str) -> Option<Arc<Repo>> {
        let canonical = RepoLocation::parse(url).url();
        self.repos.iter().find(|repo| repo.url() == canonical).cloned()
    }

    pub fn repos_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Arc<Repo>> {
        self.repos.iter().filter(move |repo| repo.kind() == Some(kind))
    }

    /// Recipes in load order.
    pub fn recipes(&self) -> impl Iterator<Item = &Arc<Repo>> {
        self.repos.iter().filter(|repo| repo.is_recipe())
    }

    /// Most recently added repo of `kind`; outputs land there.
    pub fn destination(&self, kind: &str) -> Option<Arc<Repo>> {
        self.repos
            .iter()
            .rev()
            .find(|repo| repo.kind() == Some(kind))
            .cloned()
    }

    pub fn merged(&self) -> Arc<MergedConfig> {
        self.merged.clone()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.merged.get(path)
    }

    /// Typed lookup. `Ok(None)` when absent, an error when present but of the
    /// wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get(path) {
            None => Ok(None),
            Some(value) => value
                .try_into()
                .map(Some)
                .with_context(|| format!("Config key '{path}' has an unexpected type")),
        }
    }

    pub fn get_list(&self, section: &str) -> Vec<Sourced<Value>> {
        self.merged.list(section).to_vec()
    }
}
