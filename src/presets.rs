use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::repo::REPO_DOCUMENT;

pub const PRESET_KINDS: &[&str] = &["raw", "master", "processed", "recipe"];

#[derive(Debug, Clone, Serialize)]
struct PresetRepo {
    repo: RepoSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipe: Option<RecipeSection>,
}

#[derive(Debug, Clone, Serialize)]
struct RepoSection {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    relative: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
struct RecipeSection {
    name: String,
    description: String,
    stage: BTreeMap<String, TaskPreset>,
}

#[derive(Debug, Clone, Serialize)]
struct TaskPreset {
    tool: String,
    script: String,
    input: BTreeMap<String, toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<BTreeMap<String, String>>,
}

/// Writes a starter `stackwright.toml` for a repo of `kind` into `dir`.
/// An existing document is never overwritten.
pub fn generate_preset(kind: &str, dir: &Path) -> Result<PathBuf> {
    let preset = match kind {
        "raw" => raw_preset(),
        "master" => master_preset(),
        "processed" => processed_preset(),
        "recipe" => recipe_preset(dir),
        other => anyhow::bail!(
            "Unknown repo kind '{other}'. Available kinds: {}",
            PRESET_KINDS.join(", ")
        ),
    };

    let destination = dir.join(REPO_DOCUMENT);
    if destination.exists() {
        anyhow::bail!("{} already exists", destination.display());
    }
    let rendered = toml::to_string_pretty(&preset)?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    fs::write(&destination, rendered)
        .with_context(|| format!("Failed to write repo document: {}", destination.display()))?;

    Ok(destination)
}

fn plain(kind: &str) -> PresetRepo {
    PresetRepo {
        repo: RepoSection {
            kind: kind.into(),
            relative: None,
        },
        recipe: None,
    }
}

fn raw_preset() -> PresetRepo {
    plain("raw")
}

fn master_preset() -> PresetRepo {
    let mut preset = plain("master");
    preset.repo.relative = Some(relative(&[
        ("default", "{imagetyp}/{instrument}_{date}.fits"),
        ("flat", "{imagetyp}/{instrument}_{filter}_{date}.fits"),
    ]));
    preset
}

fn processed_preset() -> PresetRepo {
    let mut preset = plain("processed");
    preset.repo.relative = Some(relative(&[("default", "{target}/{target}_{date}.fits")]));
    preset
}

fn recipe_preset(dir: &Path) -> PresetRepo {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "recipe".to_string());
    let mut stage = BTreeMap::new();
    stage.insert(
        "light".to_string(),
        TaskPreset {
            tool: "siril".into(),
            script: "cd {input_dir}\nconvert light_{session.index} -out={process_dir}\n".into(),
            input: input(&[
                ("source", "session"),
                ("type", "light"),
            ]),
            output: None,
        },
    );
    stage.insert(
        "stack".to_string(),
        TaskPreset {
            tool: "siril".into(),
            script: "cd {process_dir}\nstack light_ {rejection} -out={output.full_path}\n".into(),
            input: input(&[("source", "recipe"), ("path", "light_*.fit*")]),
            output: Some(relative(&[("kind", "processed")])),
        },
    );
    PresetRepo {
        repo: RepoSection {
            kind: "recipe".into(),
            relative: None,
        },
        recipe: Some(RecipeSection {
            name,
            description: "Starter recipe; adjust the scripts to your workflow".into(),
            stage,
        }),
    }
}

fn relative(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn input(entries: &[(&str, &str)]) -> BTreeMap<String, toml::Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), toml::Value::String(v.to_string())))
        .collect()
}
