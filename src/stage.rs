//! Typed stage definitions. A *phase* (`[[stages]]`) orders the pipeline; a
//! *task* (`[recipe.stage.<phase>]` or `[[stage]]`) is one tool invocation
//! belonging to a phase.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::error::ProcessingError;
use crate::repo::{Repo, RepoManager, Sourced};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    /// Calibration masters, generated across every indexed session.
    Master,
    /// Runs once per light session of a target.
    #[default]
    Session,
    /// Runs once per target after all sessions.
    Target,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseDef {
    pub name: String,
    pub priority: i64,
    pub kind: PhaseKind,
}

impl PhaseDef {
    pub fn new(name: impl Into<String>, priority: i64, kind: PhaseKind) -> Self {
        Self {
            name: name.into(),
            priority,
            kind,
        }
    }

    fn from_value(value: &Value, origin: &str) -> Result<Self> {
        let table = value.as_table().ok_or_else(|| {
            ProcessingError::config(format!("'stages' entry in {origin} must be a table"))
        })?;
        let name = table
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProcessingError::config(format!("'stages' entry in {origin} is missing 'name'"))
            })?
            .to_string();
        let priority = table
            .get("priority")
            .and_then(Value::as_integer)
            .ok_or_else(|| {
                ProcessingError::config(format!(
                    "Stage '{name}' in {origin} must declare an integer 'priority'"
                ))
            })?;
        let kind = match table.get("kind") {
            None => PhaseKind::default(),
            Some(kind) => kind.clone().try_into().map_err(|_| {
                ProcessingError::config(format!(
                    "Stage '{name}' in {origin} has an unknown kind {kind}"
                ))
            })?,
        };
        Ok(Self {
            name,
            priority,
            kind,
        })
    }
}

/// Every declared phase ordered by priority. A phase declared again in a
/// later repo replaces the earlier declaration.
pub fn load_phases(repos: &RepoManager) -> Result<Vec<Sourced<PhaseDef>>> {
    let mut phases: Vec<Sourced<PhaseDef>> = Vec::new();
    for entry in repos.get_list("stages") {
        let phase = PhaseDef::from_value(&entry.value, entry.source.url())?;
        phases.retain(|existing| existing.value.name != phase.name);
        phases.push(Sourced::new(phase, entry.source));
    }
    phases.sort_by_key(|phase| phase.value.priority);
    Ok(phases)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    /// Images of the current session, from the database.
    #[default]
    Session,
    /// Files left in the run's scratch directory by earlier stages.
    Recipe,
    /// A file glob.
    Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    Color,
    Mono,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Requirement {
    /// The named header's normalised value must be listed.
    Metadata { name: String, value: Vec<String> },
    Camera { value: CameraKind },
    /// Fewer candidates is a recoverable condition; `allow_single` turns
    /// exactly one candidate into a single-file degrade instead.
    MinCount {
        value: usize,
        #[serde(default)]
        allow_single: bool,
    },
    /// Excludes images owned by master or processed repos.
    Unprocessed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InputSpec {
    pub source: InputSource,
    #[serde(rename = "type")]
    pub imagetyp: Option<String>,
    pub path: Option<String>,
    pub requires: Vec<Requirement>,
    /// Master calibration types the task needs, such as `bias` or `flat`.
    pub masters: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSpec {
    /// Kind of the destination repo, or `scratch` for the run's scratch dir.
    pub kind: Option<String>,
    /// Overrides the destination repo's `repo.relative` template.
    pub relative: Option<String>,
    /// File name inside the scratch dir.
    pub name: Option<String>,
}

pub const SCRATCH_OUTPUT: &str = "scratch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Inline(String),
    File(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub when: String,
    pub tool: String,
    #[serde(default)]
    pub input: InputSpec,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default)]
    pub context: Table,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub script_file: Option<String>,
    /// Seconds; falls back to `processing.tool-timeout`.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl TaskDef {
    /// Parses a task table. `phase` fills `name` and `when` when the table
    /// does not set them.
    pub fn parse(value: &Value, phase: Option<&str>, origin: &str) -> Result<Self> {
        let mut task: TaskDef = value.clone().try_into().map_err(|err| {
            ProcessingError::config(format!("Invalid stage definition in {origin}: {err}"))
        })?;
        if task.name.is_empty() {
            task.name = phase.map(str::to_string).ok_or_else(|| {
                ProcessingError::config(format!("'stage' entry in {origin} is missing 'name'"))
            })?;
        }
        if task.when.is_empty() {
            task.when = phase.map(str::to_string).unwrap_or_else(|| task.name.clone());
        }
        Ok(task)
    }

    pub fn script_source(&self) -> Result<ScriptSource> {
        match (&self.script, &self.script_file) {
            (Some(script), None) => Ok(ScriptSource::Inline(script.clone())),
            (None, Some(file)) => Ok(ScriptSource::File(file.clone())),
            (Some(_), Some(_)) => Err(ProcessingError::config(format!(
                "Stage '{}' sets both 'script' and 'script-file'",
                self.name
            ))
            .into()),
            (None, None) => Err(ProcessingError::config(format!(
                "Stage '{}' needs a 'script' or 'script-file'",
                self.name
            ))
            .into()),
        }
    }

    /// The image type this task produces or consumes, used to pick
    /// type-specific output templates.
    pub fn imagetyp(&self) -> Option<&str> {
        self.input.imagetyp.as_deref()
    }
}

/// The task `recipe` declares for `phase`, if any.
pub fn recipe_task(recipe: &Arc<Repo>, phase: &str) -> Result<Option<Sourced<TaskDef>>> {
    if let Some(value) = recipe.get(&format!("recipe.stage.{phase}")) {
        let task = TaskDef::parse(value, Some(phase), recipe.url())?;
        return Ok(Some(Sourced::new(task, recipe.clone())));
    }
    let Some(entries) = recipe.config().get("stage").and_then(Value::as_array) else {
        return Ok(None);
    };
    for entry in entries {
        let task = TaskDef::parse(entry, None, recipe.url())?;
        if task.when == phase {
            return Ok(Some(Sourced::new(task, recipe.clone())));
        }
    }
    Ok(None)
}

/// Every task declared anywhere, in load order.
pub fn all_tasks(repos: &RepoManager) -> Result<Vec<Sourced<TaskDef>>> {
    let mut tasks = Vec::new();
    for repo in repos.repos() {
        if let Some(Value::Table(stages)) = repo.get("recipe.stage") {
            for (phase, value) in stages {
                let task = TaskDef::parse(value, Some(phase), repo.url())?;
                tasks.push(Sourced::new(task, repo.clone()));
            }
        }
    }
    for entry in repos.get_list("stage") {
        let task = TaskDef::parse(&entry.value, None, entry.source.url())?;
        tasks.push(Sourced::new(task, entry.source));
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::find_processing_error;

    fn manager(docs: &[(&str, &str)]) -> RepoManager {
        let mut repos = RepoManager::new();
        for (url, doc) in docs {
            repos.add_loaded(Repo::from_table(url, toml::from_str(doc).unwrap()).unwrap());
        }
        repos
    }

    #[test]
    fn phases_sort_by_priority() {
        let repos = manager(&[
            (
                "/a",
                "[[stages]]\nname = \"stack\"\npriority = 200\nkind = \"target\"\n",
            ),
            (
                "/b",
                "[[stages]]\nname = \"master-bias\"\npriority = 10\nkind = \"master\"\n[[stages]]\nname = \"light\"\npriority = 100\n",
            ),
        ]);
        let phases = load_phases(&repos).unwrap();
        let names: Vec<&str> = phases.iter().map(|p| p.value.name.as_str()).collect();
        assert_eq!(names, vec!["master-bias", "light", "stack"]);
        assert_eq!(phases[1].value.kind, PhaseKind::Session);
    }

    #[test]
    fn missing_priority_is_a_configuration_error() {
        let repos = manager(&[("/a", "[[stages]]\nname = \"light\"\n")]);
        let err = load_phases(&repos).unwrap_err();
        assert!(find_processing_error(&err).unwrap().is_config());
        assert!(err.to_string().contains("priority"));
    }

    #[test]
    fn recipe_task_reads_both_declaration_forms() {
        let repos = manager(&[(
            "/recipe",
            r#"
            [repo]
            kind = "recipe"

            [recipe.stage.light]
            tool = "shell"
            script = "true"
            [recipe.stage.light.input]
            type = "light"
            requires = [{ kind = "min_count", value = 2 }, { kind = "camera", value = "color" }]

            [[stage]]
            name = "stack-all"
            when = "stack"
            tool = "builtin"
            script = "touch {output.full_path}"
            input = { source = "recipe", path = "*.fits" }
            "#,
        )]);
        let recipe = repos.recipes().next().unwrap().clone();
        let light = recipe_task(&recipe, "light").unwrap().unwrap();
        assert_eq!(light.value.name, "light");
        assert_eq!(light.value.imagetyp(), Some("light"));
        assert_eq!(
            light.value.input.requires[0],
            Requirement::MinCount {
                value: 2,
                allow_single: false
            }
        );
        let stack = recipe_task(&recipe, "stack").unwrap().unwrap();
        assert_eq!(stack.value.name, "stack-all");
        assert_eq!(stack.value.input.source, InputSource::Recipe);
        assert!(recipe_task(&recipe, "master-dark").unwrap().is_none());
        assert_eq!(all_tasks(&repos).unwrap().len(), 2);
    }

    #[test]
    fn script_source_requires_exactly_one() {
        let task = TaskDef::parse(
            &toml::from_str::<Value>("tool = \"shell\"").unwrap(),
            Some("light"),
            "test",
        )
        .unwrap();
        assert!(task.script_source().is_err());
    }
}
