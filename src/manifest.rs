//! Per-target manifest written next to the final output, recording what
//! produced it.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::repo::Repo;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetManifest {
    pub target: String,
    pub generated_at: DateTime<Utc>,
    pub recipe: RecipeLock,
    pub sessions: Vec<SessionEntry>,
    pub stages: Vec<StageEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeLock {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub date: String,
    pub filter: String,
    pub telescope: String,
    pub images: u32,
    pub exposure_secs: f64,
}

impl SessionEntry {
    pub fn from_session(session: &Session) -> Self {
        Self {
            date: session.date(),
            filter: session.meta(crate::session::keys::FILTER).unwrap_or("").to_string(),
            telescope: session.key.telescop.clone(),
            images: session.num_images,
            exposure_secs: session.exptime_total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub name: String,
    pub phase: String,
    pub tool: String,
    pub status: String,
}

impl RecipeLock {
    pub fn from_repo(recipe: &Repo) -> Result<Self> {
        Ok(Self {
            url: recipe.url().to_string(),
            sha256: recipe_hash(recipe)?,
        })
    }
}

/// Identity of a recipe's resolved configuration.
pub fn recipe_hash(recipe: &Repo) -> Result<String> {
    let serialized = serde_json::to_vec(recipe.config())
        .with_context(|| format!("Failed to serialize recipe {}", recipe.url()))?;
    let mut hasher = Sha256::new();
    hasher.update(recipe.url().as_bytes());
    hasher.update(serialized);
    Ok(format!("{:x}", hasher.finalize()))
}

/// `<output>.manifest.yaml` beside the final output.
pub fn manifest_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".manifest.yaml");
    output.with_file_name(name)
}

pub fn write_manifest(manifest: &TargetManifest, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create manifest: {}", path.display()))?;
    serde_yaml::to_writer(file, manifest)
        .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<TargetManifest> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse manifest: {}", path.display()))
}
