//! The persisted session selection used by `process auto`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::database::SessionQuery;

#[derive(Debug, Clone)]
pub struct SelectionStore {
    path: PathBuf,
    query: SessionQuery,
}

impl SelectionStore {
    /// Opens the selection at `path`; a missing file selects everything.
    pub fn load(path: &Path) -> Result<Self> {
        let query = if path.is_file() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read selection: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse selection: {}", path.display()))?
        } else {
            SessionQuery::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            query,
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let rendered = toml::to_string_pretty(&self.query)
            .context("Failed to serialize selection")?;
        fs::write(&self.path, rendered)
            .with_context(|| format!("Failed to write selection: {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Selection saved");
        Ok(())
    }

    /// The active filter, or `None` when nothing is selected explicitly.
    pub fn query(&self) -> Option<&SessionQuery> {
        (!self.query.is_empty()).then_some(&self.query)
    }

    pub fn add_target(&mut self, target: &str) {
        if !self.query.targets.iter().any(|t| t == target) {
            self.query.targets.push(target.to_string());
        }
    }

    pub fn add_filter(&mut self, filter: &str) {
        if !self.query.filters.iter().any(|f| f == filter) {
            self.query.filters.push(filter.to_string());
        }
    }

    pub fn set_dates(&mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) {
        self.query.from = from;
        self.query.to = to;
    }

    pub fn clear(&mut self) {
        self.query = SessionQuery::default();
    }
}
