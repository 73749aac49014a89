//! Recipe selection and requirement filtering.

pub mod store;

use std::sync::Arc;

use anyhow::Result;
use toml::Value;
use tracing::debug;

pub use store::SelectionStore;

use crate::error::ProcessingError;
use crate::repo::{Repo, RepoManager, Sourced, resolve_image_path};
use crate::session::{ImageRecord, Session, keys, normalize_imagetyp, normalize_token};
use crate::stage::{CameraKind, InputSource, InputSpec, PhaseDef, Requirement, TaskDef, recipe_task};

#[derive(Debug, Clone)]
pub struct SelectedRecipe {
    pub recipe: Arc<Repo>,
    pub task: Sourced<TaskDef>,
}

/// First recipe, in load order, that declares a task for `step` whose input
/// type fits the session and whose `recipe.auto.require` predicates all hold.
pub fn get_recipe_for_session(
    repos: &RepoManager,
    session: &Session,
    step: &PhaseDef,
) -> Result<Option<SelectedRecipe>> {
    for recipe in repos.recipes() {
        let Some(task) = recipe_task(recipe, &step.name)? else {
            continue;
        };
        if !task_accepts_session(&task.value, session) {
            debug!(recipe = %recipe.url(), step = %step.name, "Recipe input type does not fit session");
            continue;
        }
        if !recipe_requirements_met(recipe, session)? {
            debug!(recipe = %recipe.url(), step = %step.name, "Recipe requirements not met");
            continue;
        }
        return Ok(Some(SelectedRecipe {
            recipe: recipe.clone(),
            task,
        }));
    }
    Ok(None)
}

/// Whether `task` consumes images of the session's type. Tasks reading the
/// scratch directory accept any session.
pub fn task_accepts_session(task: &TaskDef, session: &Session) -> bool {
    if task.input.source == InputSource::Recipe {
        return true;
    }
    task.imagetyp()
        .map(|kind| normalize_imagetyp(kind) == session.imagetyp())
        .unwrap_or(false)
}

fn string_list(recipe: &Repo, path: &str) -> Result<Option<Vec<String>>> {
    match recipe.get(path) {
        None => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ProcessingError::config(format!(
                        "'{path}' in {} must list strings",
                        recipe.url()
                    ))
                    .into()
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(Value::String(single)) => Ok(Some(vec![single.clone()])),
        Some(_) => Err(ProcessingError::config(format!(
            "'{path}' in {} must be a list of strings",
            recipe.url()
        ))
        .into()),
    }
}

fn listed(list: &[String], value: &str) -> bool {
    let value = normalize_token(value);
    list.iter().any(|item| normalize_token(item) == value)
}

/// Evaluates the opt-in `recipe.auto.require` predicates against `session`.
pub fn recipe_requirements_met(recipe: &Repo, session: &Session) -> Result<bool> {
    if let Some(filters) = string_list(recipe, "recipe.auto.require.filter")?
        && !listed(&filters, &session.key.filter)
    {
        return Ok(false);
    }
    match recipe.get("recipe.auto.require.color") {
        None => {}
        Some(Value::Boolean(wants_color)) => {
            if *wants_color != session.is_color() {
                return Ok(false);
            }
        }
        Some(_) => {
            return Err(ProcessingError::config(format!(
                "'recipe.auto.require.color' in {} must be a boolean",
                recipe.url()
            ))
            .into());
        }
    }
    if let Some(cameras) = string_list(recipe, "recipe.auto.require.camera")? {
        let Some(instrument) = session.meta(keys::INSTRUME) else {
            return Ok(false);
        };
        if !listed(&cameras, instrument) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn metadata_matches(image: &ImageRecord, name: &str, allowed: &[String]) -> bool {
    let Some(actual) = image.meta(name) else {
        return false;
    };
    if name == keys::IMAGETYP {
        let actual = normalize_imagetyp(actual);
        return allowed.iter().any(|item| normalize_imagetyp(item) == actual);
    }
    listed(allowed, actual)
}

/// Applies the input's `requires` predicates to `candidates`. A `min_count`
/// that is not met is reported as [`ProcessingError::NotEnoughFiles`], or as
/// [`ProcessingError::UseSingleFile`] when the requirement accepts a single
/// file and exactly one remains.
pub fn filter_by_requires(
    repos: &RepoManager,
    stage: &str,
    input: &InputSpec,
    candidates: Vec<ImageRecord>,
) -> Result<Vec<ImageRecord>> {
    let mut kept = candidates;
    let mut min_count: Option<(usize, bool)> = None;
    for requirement in &input.requires {
        match requirement {
            Requirement::Metadata { name, value } => {
                kept.retain(|image| metadata_matches(image, name, value));
            }
            Requirement::Camera { value } => {
                let wants_color = *value == CameraKind::Color;
                kept.retain(|image| image.is_color() == wants_color);
            }
            Requirement::Unprocessed => {
                kept.retain(|image| {
                    repos
                        .repo_by_url(&image.repo_url)
                        .map(|repo| !repo.is_processed_output())
                        .unwrap_or(true)
                });
            }
            Requirement::MinCount {
                value,
                allow_single,
            } => {
                min_count = Some((*value, *allow_single));
            }
        }
    }
    if let Some((needed, allow_single)) = min_count
        && kept.len() < needed
    {
        let paths: Vec<_> = kept
            .iter()
            .map(|image| resolve_image_path(&image.repo_url, &image.path))
            .collect();
        if allow_single && paths.len() == 1 {
            return Err(ProcessingError::UseSingleFile {
                stage: stage.to_string(),
                file: paths[0].clone(),
            }
            .into());
        }
        return Err(ProcessingError::NotEnoughFiles {
            stage: stage.to_string(),
            needed,
            candidates: paths,
        }
        .into());
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::find_processing_error;
    use crate::stage::PhaseKind;
    use std::collections::BTreeMap;

    fn manager(docs: &[(&str, &str)]) -> RepoManager {
        let mut repos = RepoManager::new();
        for (url, doc) in docs {
            repos.add_loaded(Repo::from_table(url, toml::from_str(doc).unwrap()).unwrap());
        }
        repos
    }

    fn image(repo: &str, name: &str, extra: &[(&str, &str)]) -> ImageRecord {
        let mut meta = BTreeMap::from([
            (keys::IMAGETYP.to_string(), "Light".to_string()),
            (keys::FILTER.to_string(), "HaOiii".to_string()),
            (keys::OBJECT.to_string(), "IC 1396".to_string()),
            (keys::DATE_OBS.to_string(), "2025-08-01T23:00:00".to_string()),
        ]);
        for (k, v) in extra {
            meta.insert(k.to_string(), v.to_string());
        }
        ImageRecord::new(repo, format!("{name}.fits"), meta)
    }

    fn session(extra: &[(&str, &str)]) -> Session {
        Session::from_image(&image("file:///raw", "ref", extra)).unwrap()
    }

    fn light_phase() -> PhaseDef {
        PhaseDef::new("light", 100, PhaseKind::Session)
    }

    const LIGHT_TASK: &str = "[recipe.stage.light]\ntool = \"shell\"\nscript = \"true\"\ninput = { type = \"light\" }\n";

    #[test]
    fn recipe_without_task_is_never_selected() {
        let repos = manager(&[
            (
                "/no-task",
                "[repo]\nkind = \"recipe\"\n[recipe.stage.stack]\ntool = \"shell\"\nscript = \"true\"\ninput = { source = \"recipe\" }\n",
            ),
            ("/light", &format!("[repo]\nkind = \"recipe\"\n{LIGHT_TASK}")),
        ]);
        let chosen = get_recipe_for_session(&repos, &session(&[]), &light_phase())
            .unwrap()
            .unwrap();
        assert_eq!(chosen.recipe.url(), "file:///light");
    }

    #[test]
    fn unconstrained_recipe_matches_any_light_session() {
        let repos = manager(&[("/any", &format!("[repo]\nkind = \"recipe\"\n{LIGHT_TASK}"))]);
        for filter in ["L", "HaOiii", "SiiOiii"] {
            let s = session(&[(keys::FILTER, filter)]);
            assert!(
                get_recipe_for_session(&repos, &s, &light_phase())
                    .unwrap()
                    .is_some()
            );
        }
        let dark = session(&[(keys::IMAGETYP, "Dark")]);
        assert!(
            get_recipe_for_session(&repos, &dark, &light_phase())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn requirements_filter_recipes_and_first_match_wins() {
        let repos = manager(&[
            (
                "/duo",
                &format!(
                    "[repo]\nkind = \"recipe\"\n[recipe.auto.require]\nfilter = [\"HaOiii\"]\ncolor = true\ncamera = [\"ASI2600MC\"]\n{LIGHT_TASK}"
                ),
            ),
            ("/fallback", &format!("[repo]\nkind = \"recipe\"\n{LIGHT_TASK}")),
        ]);
        let color = session(&[(keys::BAYERPAT, "RGGB"), (keys::INSTRUME, "asi-2600mc")]);
        let chosen = get_recipe_for_session(&repos, &color, &light_phase())
            .unwrap()
            .unwrap();
        assert_eq!(chosen.recipe.url(), "file:///duo");

        let mono = session(&[(keys::INSTRUME, "ASI2600MC")]);
        let chosen = get_recipe_for_session(&repos, &mono, &light_phase())
            .unwrap()
            .unwrap();
        assert_eq!(chosen.recipe.url(), "file:///fallback");

        let again = get_recipe_for_session(&repos, &mono, &light_phase())
            .unwrap()
            .unwrap();
        assert_eq!(again.recipe.url(), chosen.recipe.url());
    }

    #[test]
    fn filter_by_requires_applies_each_predicate() {
        let repos = manager(&[("/masters", "[repo]\nkind = \"master\"\n")]);
        let input = InputSpec {
            requires: vec![
                Requirement::Metadata {
                    name: keys::FILTER.into(),
                    value: vec!["ha-oiii".into()],
                },
                Requirement::Camera {
                    value: CameraKind::Color,
                },
                Requirement::Unprocessed,
            ],
            ..Default::default()
        };
        let candidates = vec![
            image("file:///raw", "keep", &[(keys::BAYERPAT, "RGGB")]),
            image("file:///raw", "mono", &[]),
            image("file:///raw", "sii", &[(keys::BAYERPAT, "RGGB"), (keys::FILTER, "SiiOiii")]),
            image("file:///masters", "processed", &[(keys::BAYERPAT, "RGGB")]),
        ];
        let kept = filter_by_requires(&repos, "light", &input, candidates).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].path.to_str(), Some("keep.fits"));
    }

    #[test]
    fn min_count_reports_shortfall() {
        let repos = RepoManager::new();
        let strict = InputSpec {
            requires: vec![Requirement::MinCount {
                value: 3,
                allow_single: false,
            }],
            ..Default::default()
        };
        let err = filter_by_requires(
            &repos,
            "master-bias",
            &strict,
            vec![image("file:///raw", "a", &[])],
        )
        .unwrap_err();
        match find_processing_error(&err) {
            Some(ProcessingError::NotEnoughFiles { candidates, .. }) => {
                assert_eq!(candidates.len(), 1)
            }
            other => panic!("unexpected {other:?}"),
        }

        let lenient = InputSpec {
            requires: vec![Requirement::MinCount {
                value: 3,
                allow_single: true,
            }],
            ..Default::default()
        };
        let err = filter_by_requires(
            &repos,
            "master-bias",
            &lenient,
            vec![image("file:///raw", "a", &[])],
        )
        .unwrap_err();
        assert!(matches!(
            find_processing_error(&err),
            Some(ProcessingError::UseSingleFile { .. })
        ));
    }
}
