use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::params::ResolvedParameters;
use crate::repo::{Repo, RepoManager, Sourced};
use crate::stage::{InputSource, SCRATCH_OUTPUT, ScriptSource, TaskDef, all_tasks, load_phases};
use crate::tools::ToolRegistry;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Static checks over the merged configuration of every loaded repo.
pub fn validate_config(repos: &RepoManager, tools: &ToolRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Err(err) = ResolvedParameters::resolve(repos) {
        report.errors.push(format!("{err:#}"));
    }

    let phases = match load_phases(repos) {
        Ok(phases) => phases,
        Err(err) => {
            report.errors.push(format!("{err:#}"));
            return report;
        }
    };
    if phases.is_empty() {
        report
            .errors
            .push("No stages declared; add '[[stages]]' entries".into());
    }
    let mut priorities: BTreeMap<i64, Vec<&str>> = BTreeMap::new();
    for phase in &phases {
        priorities
            .entry(phase.value.priority)
            .or_default()
            .push(phase.value.name.as_str());
    }
    for (priority, names) in priorities {
        if names.len() > 1 {
            report.warnings.push(format!(
                "Stages {} share priority {priority}; their order follows load order",
                names.join(", ")
            ));
        }
    }
    let declared: HashSet<&str> = phases.iter().map(|p| p.value.name.as_str()).collect();

    let tasks = match all_tasks(repos) {
        Ok(tasks) => tasks,
        Err(err) => {
            report.errors.push(format!("{err:#}"));
            return report;
        }
    };
    for task in &tasks {
        report.merge(validate_task(task, &declared, repos, tools));
    }

    for recipe in repos.recipes() {
        if !tasks.iter().any(|task| same_repo(&task.source, recipe)) {
            report
                .warnings
                .push(format!("Recipe {} declares no stages", recipe.url()));
        }
    }

    if let Ok(Some(excluded)) = repos.get_as::<Vec<String>>("processing.exclude") {
        for name in excluded {
            if !declared.contains(name.as_str()) {
                report.warnings.push(format!(
                    "processing.exclude names '{name}', which is not a declared stage"
                ));
            }
        }
    }

    report
}

fn same_repo(a: &Repo, b: &Repo) -> bool {
    a.url() == b.url()
}

fn validate_task(
    task: &Sourced<TaskDef>,
    declared: &HashSet<&str>,
    repos: &RepoManager,
    tools: &ToolRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let def = &task.value;
    let origin = task.source.url();

    if !declared.contains(def.when.as_str()) {
        report.errors.push(format!(
            "Stage '{}' in {origin} runs when '{}', which is not a declared stage",
            def.name, def.when
        ));
    }

    if let Err(err) = tools.get(&def.tool) {
        report.errors.push(format!("Stage '{}' in {origin}: {err}", def.name));
    }

    match def.script_source() {
        Ok(ScriptSource::File(file)) => {
            if let Err(err) = task.source.read_file(&file) {
                report.errors.push(format!(
                    "Stage '{}' in {origin}: script file unavailable: {err}",
                    def.name
                ));
            }
        }
        Ok(ScriptSource::Inline(_)) => {}
        Err(err) => report.errors.push(format!("{err} in {origin}")),
    }

    if def.input.source == InputSource::Path {
        match def.input.path.as_deref() {
            None => report.errors.push(format!(
                "Stage '{}' in {origin} has a path input without 'path'",
                def.name
            )),
            Some(pattern) if pattern.trim().is_empty() => report.errors.push(format!(
                "Stage '{}' in {origin} has an empty input path",
                def.name
            )),
            Some(_) => {}
        }
    }
    if def.input.source == InputSource::Session && def.input.imagetyp.is_none() {
        report.warnings.push(format!(
            "Stage '{}' in {origin} reads session images but declares no input 'type'; it will never be selected",
            def.name
        ));
    }

    if let Some(kind) = def.output.kind.as_deref()
        && kind != SCRATCH_OUTPUT
        && repos.destination(kind).is_none()
    {
        report.warnings.push(format!(
            "Stage '{}' in {origin} writes to a '{kind}' repo but none is configured",
            def.name
        ));
    }

    report
}
