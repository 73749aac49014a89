use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use stackwright::context::ProcessingContext;
use stackwright::database::{Database, ImageQuery, MemoryDatabase};
use stackwright::error::{ProcessingError, find_processing_error};
use stackwright::fits::{read_header, write_header};
use stackwright::indexer::reindex_repo;
use stackwright::pipeline::{
    Orchestrator, Outcome, ProcessOptions, StageStatus, apply_session,
};
use stackwright::repo::{Repo, RepoManager};
use stackwright::session::Session;
use stackwright::stage::recipe_task;
use stackwright::tools::{Tool, ToolInvocation, ToolRegistry};
use tempfile::{TempDir, tempdir};

/// Writes the file named by its script and counts invocations.
struct CountingTool {
    calls: Arc<AtomicUsize>,
    write_output: bool,
}

impl Tool for CountingTool {
    fn name(&self) -> &str {
        "count"
    }

    fn run(&self, invocation: &ToolInvocation<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.write_output {
            let target = PathBuf::from(invocation.context.expand(invocation.script)?);
            fs::write(target, b"stacked")?;
        }
        Ok(())
    }
}

fn registry(calls: &Arc<AtomicUsize>, write_output: bool) -> ToolRegistry {
    let mut tools = ToolRegistry::with_defaults();
    tools.register(CountingTool {
        calls: calls.clone(),
        write_output,
    });
    tools
}

fn repo_dir(root: &Path, name: &str, kind: &str) -> String {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("stackwright.toml"),
        format!("[repo]\nkind = \"{kind}\"\n"),
    )
    .unwrap();
    dir.display().to_string()
}

fn frame(dir: &Path, name: &str, cards: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(name);
    let cards: BTreeMap<String, String> = cards
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    write_header(&path, &cards).unwrap();
    let past = SystemTime::now() - Duration::from_secs(120);
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(past)
        .unwrap();
    path
}

fn light(dir: &Path, name: &str, at: &str) -> PathBuf {
    frame(
        dir,
        name,
        &[
            ("IMAGETYP", "Light"),
            ("OBJECT", "M31"),
            ("FILTER", "L"),
            ("DATE-OBS", at),
            ("EXPTIME", "120"),
        ],
    )
}

fn bias(dir: &Path, name: &str, at: &str) -> PathBuf {
    frame(
        dir,
        name,
        &[
            ("IMAGETYP", "Bias"),
            ("DATE-OBS", at),
            ("EXPTIME", "0"),
            ("INSTRUME", "ASI2600MC"),
        ],
    )
}

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    repos: RepoManager,
    db: MemoryDatabase,
}

fn fixture(recipe: &str) -> Fixture {
    let temp = tempdir().unwrap();
    let root = temp.path().to_path_buf();
    let raw = repo_dir(&root, "raw", "raw");
    let processed = repo_dir(&root, "processed", "processed");
    let master = repo_dir(&root, "master", "master");

    let mut repos = RepoManager::new();
    for url in [&raw, &processed, &master] {
        repos.add_repo(url).unwrap();
    }
    repos.add_loaded(Repo::from_table("/recipe", toml::from_str(recipe).unwrap()).unwrap());

    Fixture {
        _temp: temp,
        root,
        repos,
        db: MemoryDatabase::new(),
    }
}

impl Fixture {
    fn index(&mut self) {
        let raw = self
            .repos
            .repo_by_url(&self.root.join("raw").display().to_string())
            .unwrap();
        reindex_repo(&raw, &mut self.db, false).unwrap();
    }

    fn session(&self) -> Session {
        self.db.search_session(None).unwrap().remove(0)
    }

    fn options(&self, force: bool) -> ProcessOptions {
        let mut options = ProcessOptions::new(self.root.join("scratch"));
        options.force = force;
        options
    }
}

const COUNTING_RECIPE: &str = r#"
[repo]
kind = "recipe"

[recipe.stage.light]
tool = "count"
script = "{output.full_path}"
input = { type = "light" }
output = { kind = "processed" }
"#;

fn context_for(session: &Session) -> ProcessingContext {
    let mut ctx = ProcessingContext::new();
    apply_session(&mut ctx, session, 0);
    ctx
}

#[test]
fn cached_output_skips_the_tool_until_forced() {
    let mut fx = fixture(COUNTING_RECIPE);
    let raw = fx.root.join("raw");
    light(&raw, "m31_001.fits", "2025-09-01T21:00:00");
    light(&raw, "m31_002.fits", "2025-09-01T21:05:00");
    fx.index();
    let session = fx.session();
    let recipe = fx.repos.repo_by_url("/recipe").unwrap();
    let task = recipe_task(&recipe, "light").unwrap().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = fx.options(false);
    let forced = fx.options(true);

    let expected = fx.root.join("processed/M31/M31_2025-09-01.fits");
    {
        let mut orchestrator =
            Orchestrator::new(&fx.repos, &mut fx.db, registry(&calls, true), options).unwrap();

        let first = orchestrator
            .run_stage(&task, Some(&session), context_for(&session))
            .unwrap();
        assert_eq!(first.status, StageStatus::Ran);
        assert_eq!(first.output.as_deref(), Some(expected.as_path()));
        assert!(expected.is_file());

        let second = orchestrator
            .run_stage(&task, Some(&session), context_for(&session))
            .unwrap();
        assert_eq!(second.status, StageStatus::Cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            second.patch.get("stage.light.output").and_then(|v| v.as_str()),
            Some(expected.display().to_string().as_str())
        );

        let snapshot = orchestrator.metrics().snapshot();
        assert_eq!(snapshot.stages["light"].ran, 1);
        assert_eq!(snapshot.stages["light"].cached, 1);
    }

    let mut orchestrator =
        Orchestrator::new(&fx.repos, &mut fx.db, registry(&calls, true), forced).unwrap();
    let third = orchestrator
        .run_stage(&task, Some(&session), context_for(&session))
        .unwrap();
    assert_eq!(third.status, StageStatus::Ran);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn tool_that_writes_nothing_is_missing_output() {
    let mut fx = fixture(COUNTING_RECIPE);
    light(&fx.root.join("raw"), "m31_001.fits", "2025-09-01T21:00:00");
    fx.index();
    let session = fx.session();
    let recipe = fx.repos.repo_by_url("/recipe").unwrap();
    let task = recipe_task(&recipe, "light").unwrap().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = fx.options(false);

    let mut orchestrator =
        Orchestrator::new(&fx.repos, &mut fx.db, registry(&calls, false), options).unwrap();
    let err = orchestrator
        .run_stage(&task, Some(&session), context_for(&session))
        .unwrap_err();
    assert!(matches!(
        find_processing_error(&err),
        Some(ProcessingError::MissingOutput { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_tool_is_a_configuration_error() {
    let mut fx = fixture(
        "[repo]\nkind = \"recipe\"\n[recipe.stage.light]\ntool = \"pixinsight\"\nscript = \"x\"\ninput = { type = \"light\" }\n",
    );
    light(&fx.root.join("raw"), "m31_001.fits", "2025-09-01T21:00:00");
    fx.index();
    let session = fx.session();
    let recipe = fx.repos.repo_by_url("/recipe").unwrap();
    let task = recipe_task(&recipe, "light").unwrap().unwrap();
    let options = fx.options(false);

    let mut orchestrator =
        Orchestrator::new(&fx.repos, &mut fx.db, ToolRegistry::with_defaults(), options).unwrap();
    let err = orchestrator
        .run_stage(&task, Some(&session), context_for(&session))
        .unwrap_err();
    let found = find_processing_error(&err).unwrap();
    assert!(found.is_config());
    assert!(err.to_string().contains("pixinsight"));
}

const MASTER_RECIPE: &str = r#"
[repo]
kind = "recipe"

[[stages]]
name = "master-bias"
priority = 10
kind = "master"

[recipe.stage.master-bias]
tool = "builtin"
script = "stack {output.full_path} {input_files}"

[recipe.stage.master-bias.input]
type = "bias"
requires = [{ kind = "min_count", value = 2 }, { kind = "unprocessed" }]

[recipe.stage.master-bias.output]
kind = "master"
"#;

#[test]
fn master_stage_stacks_and_registers_the_master() {
    let mut fx = fixture(MASTER_RECIPE);
    let raw = fx.root.join("raw");
    for n in 0..3 {
        bias(&raw, &format!("bias_{n}.fits"), &format!("2025-09-02T10:0{n}:00"));
    }
    fx.index();
    let options = fx.options(false);
    let master_url = format!("file://{}", fx.root.join("master").display());

    let results = {
        let mut orchestrator =
            Orchestrator::new(&fx.repos, &mut fx.db, ToolRegistry::with_defaults(), options)
                .unwrap();
        orchestrator.run_master_stages().unwrap()
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, Outcome::Success);
    assert_eq!(results[0].note, None);

    let output = fx.root.join("master/bias/master_bias_2025-09-02.fits");
    assert_eq!(results[0].output.as_deref(), Some(output.as_path()));
    let header = read_header(&output).unwrap();
    assert_eq!(header.get("NCOMBINE").map(String::as_str), Some("3"));

    let masters = fx
        .db
        .search_image(&ImageQuery::new().in_repos(vec![master_url.clone()]))
        .unwrap();
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].imagetyp().as_deref(), Some("bias"));

    let raw_bias = |db: &MemoryDatabase| {
        db.search_session(None)
            .unwrap()
            .into_iter()
            .find(|s| s.reference.repo_url != master_url)
            .unwrap()
    };
    assert_eq!(raw_bias(&fx.db).num_images, 3);
    fx.db.remove_repo(&master_url).unwrap();
    assert_eq!(raw_bias(&fx.db).num_images, 3);
    assert_eq!(fx.db.search_session(None).unwrap().len(), 1);
}

#[test]
fn cached_master_missing_from_the_database_is_registered() {
    let mut fx = fixture(MASTER_RECIPE);
    let raw = fx.root.join("raw");
    for n in 0..2 {
        bias(&raw, &format!("bias_{n}.fits"), &format!("2025-09-02T10:0{n}:00"));
    }
    fx.index();
    let master_url = format!("file://{}", fx.root.join("master").display());
    let masters_query = ImageQuery::new().in_repos(vec![master_url.clone()]);

    let options = fx.options(false);
    Orchestrator::new(&fx.repos, &mut fx.db, ToolRegistry::with_defaults(), options)
        .unwrap()
        .run_master_stages()
        .unwrap();
    fx.db.remove_repo(&master_url).unwrap();
    assert!(fx.db.search_image(&masters_query).unwrap().is_empty());

    let options = fx.options(false);
    let results = Orchestrator::new(&fx.repos, &mut fx.db, ToolRegistry::with_defaults(), options)
        .unwrap()
        .run_master_stages()
        .unwrap();
    assert_eq!(results[0].note.as_deref(), Some("up to date"));
    assert_eq!(fx.db.search_image(&masters_query).unwrap().len(), 1);
}

#[test]
fn single_master_frame_is_copied() {
    let mut fx = fixture(MASTER_RECIPE);
    let only = bias(&fx.root.join("raw"), "bias_0.fits", "2025-09-02T10:00:00");
    fx.index();
    let options = fx.options(false);

    let mut orchestrator =
        Orchestrator::new(&fx.repos, &mut fx.db, ToolRegistry::with_defaults(), options).unwrap();
    let results = orchestrator.run_master_stages().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, Outcome::Success);
    assert_eq!(results[0].note.as_deref(), Some("single input copied"));
    let copied = results[0].output.clone().unwrap();
    assert_eq!(fs::read(copied).unwrap(), fs::read(only).unwrap());
}
