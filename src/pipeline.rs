//! The recipe-driven orchestrator: runs master, session and target stages
//! against the indexed sessions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use glob::glob;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::context::{ContextPatch, ProcessingContext, vars};
use crate::database::{Database, ImageQuery, SessionQuery, add_image};
use crate::error::{ProcessingError, find_processing_error};
use crate::fits::{is_fits_path, read_header};
use crate::manifest::{
    RecipeLock, SessionEntry, StageEntry, TargetManifest, manifest_path, write_manifest,
};
use crate::observability::MetricsCollector;
use crate::params::ResolvedParameters;
use crate::repo::{Repo, RepoManager, Sourced, resolve_image_path};
use crate::scoring::score_candidates;
use crate::selection::{
    filter_by_requires, get_recipe_for_session, recipe_requirements_met, task_accepts_session,
};
use crate::session::{ImageRecord, Session, keys};
use crate::scratch::ScratchDir;
use crate::stage::{
    InputSource, PhaseDef, PhaseKind, SCRATCH_OUTPUT, ScriptSource, TaskDef, load_phases,
    recipe_task,
};
use crate::tools::{DEFAULT_TIMEOUT, ToolInvocation, ToolRegistry};

/// Output template used when neither the task nor the destination repo
/// declares one.
const DEFAULT_RELATIVE: &str = "{target}/{target}_{date}.fits";
const DEFAULT_MASTER_RELATIVE: &str = "{imagetyp}/master_{imagetyp}_{date}.fits";

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Re-run stages even when their output is up to date.
    pub force: bool,
    pub default_timeout: Duration,
    pub scratch_root: PathBuf,
    /// Stages not to run, in addition to `processing.exclude`.
    pub exclude: Vec<String>,
}

impl ProcessOptions {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            force: false,
            default_timeout: DEFAULT_TIMEOUT,
            scratch_root: scratch_root.into(),
            exclude: Vec::new(),
        }
    }

    /// Reads `processing.tool-timeout` and `processing.exclude`.
    pub fn from_config(repos: &RepoManager, scratch_root: impl Into<PathBuf>) -> Result<Self> {
        let mut options = Self::new(scratch_root);
        if let Some(secs) = repos.get_as::<u64>("processing.tool-timeout")? {
            options.default_timeout = Duration::from_secs(secs);
        }
        if let Some(exclude) = repos.get_as::<Vec<String>>("processing.exclude")? {
            options.exclude = exclude;
        }
        Ok(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Ran,
    Cached,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Ran => "ran",
            StageStatus::Cached => "cached",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub status: StageStatus,
    /// Keys to merge into the ambient context.
    pub patch: ContextPatch,
    /// The tracked output file, if the task declares one.
    pub output: Option<PathBuf>,
    /// Set when a single input was copied to the output instead of running
    /// the tool.
    pub copied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Skipped,
    Failed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Outcome::Success => "success",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub target: String,
    pub sessions: usize,
    pub outcome: Outcome,
    pub note: Option<String>,
    pub output: Option<PathBuf>,
}

impl ProcessingResult {
    fn new(target: &str, sessions: usize, outcome: Outcome, note: impl Into<Option<String>>) -> Self {
        Self {
            target: target.to_string(),
            sessions,
            outcome,
            note: note.into(),
            output: None,
        }
    }
}

/// What the error at hand means for the run.
enum Disposition {
    Abort(anyhow::Error),
    NotEnough(String),
    Skip(String),
    Fail(String),
}

fn classify(err: anyhow::Error) -> Disposition {
    match find_processing_error(&err) {
        Some(e) if e.is_config() => Disposition::Abort(err),
        Some(ProcessingError::NotEnoughFiles { .. }) => Disposition::NotEnough(format!("{err:#}")),
        Some(e) if e.is_tool() => Disposition::Skip(format!("{err:#}")),
        _ => Disposition::Fail(format!("{err:#}")),
    }
}

pub struct Orchestrator<'a> {
    repos: &'a RepoManager,
    db: &'a mut dyn Database,
    tools: ToolRegistry,
    options: ProcessOptions,
    params: ResolvedParameters,
    phases: Vec<Sourced<PhaseDef>>,
    metrics: MetricsCollector,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        repos: &'a RepoManager,
        db: &'a mut dyn Database,
        tools: ToolRegistry,
        options: ProcessOptions,
    ) -> Result<Self> {
        let params = ResolvedParameters::resolve(repos)?;
        let phases = load_phases(repos)?;
        Ok(Self {
            repos,
            db,
            tools,
            options,
            params,
            phases,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn phases(&self) -> &[Sourced<PhaseDef>] {
        &self.phases
    }

    fn phases_of(&self, kind: PhaseKind) -> Vec<PhaseDef> {
        self.phases
            .iter()
            .filter(|phase| phase.value.kind == kind)
            .map(|phase| phase.value.clone())
            .collect()
    }

    pub fn is_excluded(&self, stage: &str) -> bool {
        self.options.exclude.iter().any(|name| name == stage)
    }

    /// Context shared by every stage of one run: resolved parameters and
    /// the scratch locations.
    fn base_context(&self, scratch: &ScratchDir) -> Result<ProcessingContext> {
        let mut ctx = ProcessingContext::new();
        for (name, value) in self.params.values() {
            ctx.set(name.clone(), value.clone());
        }
        ctx.set(vars::PROCESS_DIR, scratch.subdir("process")?.display().to_string());
        ctx.set(vars::TEMP_DIR, scratch.subdir("tmp")?.display().to_string());
        Ok(ctx)
    }

    /// Runs one task. Session-sourced inputs and masters are resolved against
    /// `session`. The context is consumed; keys the caller should keep come
    /// back in the outcome's patch.
    pub fn run_stage(
        &mut self,
        task: &Sourced<TaskDef>,
        session: Option<&Session>,
        ctx: ProcessingContext,
    ) -> Result<StageOutcome> {
        self.run_stage_with(task, session, ctx, false)
    }

    #[instrument(skip_all, fields(stage = %task.value.name, tool = %task.value.tool))]
    fn run_stage_with(
        &mut self,
        task: &Sourced<TaskDef>,
        session: Option<&Session>,
        mut ctx: ProcessingContext,
        copy_single: bool,
    ) -> Result<StageOutcome> {
        let def = &task.value;
        let _timer = self.metrics.start_stage(&def.name);

        let tool = self
            .tools
            .get(&def.tool)
            .map_err(|err| ProcessingError::config(format!("Stage '{}': {err}", def.name)))?;
        let script = match def.script_source()? {
            ScriptSource::Inline(script) => script,
            ScriptSource::File(file) => task
                .source
                .read_file(&file)
                .with_context(|| format!("Loading script for stage '{}'", def.name))?,
        };
        ctx.apply_table(&def.context)?;

        let (inputs, single) = match self.resolve_inputs(def, session, &ctx) {
            Ok(inputs) => (inputs, None),
            Err(err) => match find_processing_error(&err) {
                Some(ProcessingError::UseSingleFile { file, .. }) => {
                    (vec![file.clone()], Some(file.clone()))
                }
                Some(ProcessingError::NotEnoughFiles { candidates, .. })
                    if copy_single && candidates.len() == 1 =>
                {
                    (candidates.clone(), Some(candidates[0].clone()))
                }
                _ => return Err(err),
            },
        };
        ctx.set_paths(vars::INPUT_FILES, &inputs);

        let mut dependencies = inputs.clone();
        if single.is_none() {
            for imagetyp in &def.input.masters {
                let master = self.resolve_master(&def.name, imagetyp, session)?;
                ctx.set(vars::master(imagetyp), master.display().to_string());
                dependencies.push(master);
            }
        }

        let destination = self.resolve_output(def, &mut ctx)?;
        let output = destination.as_ref().map(|(path, _)| path.clone());
        let mut patch = ContextPatch::new();
        let recorded = output
            .clone()
            .or_else(|| ctx.get_str(vars::PROCESS_DIR).map(PathBuf::from));
        if let Some(recorded) = &recorded {
            patch.insert(
                vars::stage_output(&def.name),
                recorded.display().to_string().into(),
            );
        }

        if !self.options.force
            && let Some(path) = &output
            && is_up_to_date(path, &dependencies)
        {
            info!(output = %path.display(), "Output up to date; skipping");
            if let Some((path, Some(repo))) = &destination
                && repo.kind() == Some("master")
                && !self.is_registered(repo, path)?
            {
                self.register_master(repo, path, def, session)?;
            }
            self.metrics.record_stage_status(&def.name, StageStatus::Cached);
            return Ok(StageOutcome {
                status: StageStatus::Cached,
                patch,
                output,
                copied: false,
            });
        }

        if let Some(path) = &output
            && let Some(parent) = path.parent()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        if let Some(file) = &single {
            let Some(path) = &output else {
                return Err(anyhow!(
                    "Stage '{}' has a single input but no output to copy it to",
                    def.name
                ));
            };
            warn!(input = %file.display(), output = %path.display(), "Single input; copying");
            fs::copy(file, path).with_context(|| {
                format!("Failed to copy {} to {}", file.display(), path.display())
            })?;
        } else {
            let working = self.working_dir(&def.name)?;
            let timeout = def
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(self.options.default_timeout);
            info!(inputs = inputs.len(), "Running stage");
            tool.run(&ToolInvocation {
                stage: &def.name,
                script: &script,
                context: &ctx,
                working_dir: working.path(),
                timeout,
            })?;
        }

        if let Some((path, repo)) = &destination {
            if !path.exists() {
                return Err(ProcessingError::MissingOutput {
                    stage: def.name.clone(),
                    path: path.clone(),
                }
                .into());
            }
            if let Some(repo) = repo
                && repo.kind() == Some("master")
            {
                self.register_master(repo, path, def, session)?;
            }
        }

        self.metrics.record_stage_status(&def.name, StageStatus::Ran);
        Ok(StageOutcome {
            status: StageStatus::Ran,
            patch,
            output,
            copied: single.is_some(),
        })
    }

    fn working_dir(&self, stage: &str) -> Result<tempfile::TempDir> {
        let root = &self.options.scratch_root;
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create scratch root: {}", root.display()))?;
        tempfile::Builder::new()
            .prefix(&format!("{}{stage}-", crate::scratch::SCRATCH_PREFIX))
            .tempdir_in(root)
            .with_context(|| format!("Failed to create working dir in {}", root.display()))
    }

    fn resolve_inputs(
        &self,
        def: &TaskDef,
        session: Option<&Session>,
        ctx: &ProcessingContext,
    ) -> Result<Vec<PathBuf>> {
        let candidates = match def.input.source {
            InputSource::Session => {
                let session = session.ok_or_else(|| {
                    ProcessingError::config(format!(
                        "Stage '{}' reads session images but runs without a session",
                        def.name
                    ))
                })?;
                self.db.search_image(&ImageQuery::for_session(session))?
            }
            InputSource::Path => {
                let pattern = def.input.path.as_deref().ok_or_else(|| {
                    ProcessingError::config(format!(
                        "Stage '{}' has a path input without 'path'",
                        def.name
                    ))
                })?;
                glob_records(&ctx.expand(pattern)?)?
            }
            InputSource::Recipe => {
                let process_dir = ctx.get_str(vars::PROCESS_DIR).ok_or_else(|| {
                    anyhow!("Stage '{}' reads the scratch dir but none is set", def.name)
                })?;
                let pattern = ctx.expand(def.input.path.as_deref().unwrap_or("*"))?;
                glob_records(&Path::new(process_dir).join(pattern).to_string_lossy())?
            }
        };
        let kept = filter_by_requires(self.repos, &def.name, &def.input, candidates)?;
        if kept.is_empty() {
            return Err(ProcessingError::NotEnoughFiles {
                stage: def.name.clone(),
                needed: 1,
                candidates: Vec::new(),
            }
            .into());
        }
        let mut paths: Vec<PathBuf> = kept
            .iter()
            .map(|image| resolve_image_path(&image.repo_url, &image.path))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Best scoring master of `imagetyp` for `session`.
    fn resolve_master(
        &self,
        stage: &str,
        imagetyp: &str,
        session: Option<&Session>,
    ) -> Result<PathBuf> {
        let session = session.ok_or_else(|| {
            ProcessingError::config(format!(
                "Stage '{stage}' needs a '{imagetyp}' master but runs without a session"
            ))
        })?;
        let urls: Vec<String> = self
            .repos
            .repos_of_kind("master")
            .map(|repo| repo.url().to_string())
            .collect();
        let candidates = self
            .db
            .search_image(&ImageQuery::new().field(keys::IMAGETYP, imagetyp).in_repos(urls))?;
        let ranked = score_candidates(session, &candidates);
        let best = ranked.first().ok_or_else(|| ProcessingError::MissingMaster {
            stage: stage.to_string(),
            imagetyp: imagetyp.to_string(),
        })?;
        debug!(
            imagetyp,
            master = %best.candidate.path.display(),
            score = best.score,
            reason = %best.reason(),
            "Selected master"
        );
        Ok(resolve_image_path(&best.candidate.repo_url, &best.candidate.path))
    }

    /// Works out where the task writes and records it in `ctx`. Scratch
    /// tasks without a file name have no tracked output.
    fn resolve_output(
        &self,
        def: &TaskDef,
        ctx: &mut ProcessingContext,
    ) -> Result<Option<(PathBuf, Option<Arc<Repo>>)>> {
        let kind = def.output.kind.as_deref().unwrap_or(SCRATCH_OUTPUT);
        let (path, repo) = if kind == SCRATCH_OUTPUT {
            let Some(name) = &def.output.name else {
                return Ok(None);
            };
            let process_dir = ctx
                .get_str(vars::PROCESS_DIR)
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("Stage '{}' writes to scratch but none is set", def.name))?;
            (process_dir.join(ctx.expand(name)?), None)
        } else {
            let repo = self.repos.destination(kind).ok_or_else(|| {
                ProcessingError::config(format!(
                    "No repo of kind '{kind}' to receive the output of stage '{}'",
                    def.name
                ))
            })?;
            let base = repo.base_path().ok_or_else(|| {
                ProcessingError::config(format!("Output repo {} is not a directory", repo.url()))
            })?;
            let template = def
                .output
                .relative
                .clone()
                .or_else(|| repo.relative_template(def.imagetyp()))
                .unwrap_or_else(|| {
                    if kind == "master" {
                        DEFAULT_MASTER_RELATIVE.to_string()
                    } else {
                        DEFAULT_RELATIVE.to_string()
                    }
                });
            let relative = ctx.expand(&template)?;
            let relative = relative.trim_start_matches('/');
            ctx.set(vars::OUTPUT_REPO, base.display().to_string());
            (base.join(relative), Some(repo.clone()))
        };
        ctx.set(vars::OUTPUT_FULL, path.display().to_string());
        ctx.set(vars::OUTPUT_BASE, path.with_extension("").display().to_string());
        Ok(Some((path, repo)))
    }

    /// Whether the database already knows the master at `path`.
    fn is_registered(&self, repo: &Repo, path: &Path) -> Result<bool> {
        let Some(base) = repo.base_path() else {
            return Ok(true);
        };
        let relative = path.strip_prefix(base).unwrap_or(path);
        Ok(self.db.get_image(repo.url(), relative)?.is_some())
    }

    fn register_master(
        &mut self,
        repo: &Repo,
        path: &Path,
        def: &TaskDef,
        session: Option<&Session>,
    ) -> Result<()> {
        let Some(base) = repo.base_path() else {
            return Ok(());
        };
        let mut metadata = match read_header(path) {
            Ok(header) => header,
            Err(err) => {
                debug!(output = %path.display(), "Master header unreadable ({err:#}); using session metadata");
                BTreeMap::new()
            }
        };
        if let Some(session) = session {
            for (key, value) in &session.metadata {
                metadata.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        if let Some(imagetyp) = def.imagetyp() {
            metadata.insert(keys::IMAGETYP.to_string(), imagetyp.to_string());
        }
        let relative = path.strip_prefix(base).unwrap_or(path).to_path_buf();
        add_image(&mut *self.db, ImageRecord::new(repo.url(), relative, metadata))?;
        info!(master = %path.display(), "Registered master");
        Ok(())
    }

    /// Processes every light session of one target with a single pinned
    /// recipe. Only configuration errors escape; everything else becomes
    /// the result's outcome.
    #[instrument(skip(self, sessions), fields(sessions = sessions.len()))]
    pub fn process_target(&mut self, target: &str, sessions: &[Session]) -> Result<ProcessingResult> {
        let result = match self.process_target_inner(target, sessions) {
            Ok(result) => result,
            Err(err) => match classify(err) {
                Disposition::Abort(err) => return Err(err),
                Disposition::NotEnough(note) | Disposition::Skip(note) => {
                    ProcessingResult::new(target, sessions.len(), Outcome::Skipped, note)
                }
                Disposition::Fail(note) => {
                    ProcessingResult::new(target, sessions.len(), Outcome::Failed, note)
                }
            },
        };
        self.metrics.record_target(result.outcome);
        match result.outcome {
            Outcome::Success => info!(target, "Target processed"),
            Outcome::Skipped => warn!(target, note = ?result.note, "Target skipped"),
            Outcome::Failed => warn!(target, note = ?result.note, "Target failed"),
        }
        Ok(result)
    }

    fn process_target_inner(
        &mut self,
        target: &str,
        sessions: &[Session],
    ) -> Result<ProcessingResult> {
        let mut lights: Vec<&Session> = sessions.iter().filter(|s| s.is_light()).collect();
        lights.sort_by_key(|s| s.start);
        let Some(first) = lights.first().copied() else {
            return Ok(ProcessingResult::new(
                target,
                0,
                Outcome::Skipped,
                "no light sessions".to_string(),
            ));
        };
        let session_phases = self.phases_of(PhaseKind::Session);
        let target_phases = self.phases_of(PhaseKind::Target);
        let Some(selector) = session_phases.first() else {
            return Ok(ProcessingResult::new(
                target,
                lights.len(),
                Outcome::Skipped,
                "no session stages configured".to_string(),
            ));
        };
        let Some(selected) = get_recipe_for_session(self.repos, first, selector)? else {
            return Ok(ProcessingResult::new(
                target,
                lights.len(),
                Outcome::Skipped,
                "no suitable recipe found".to_string(),
            ));
        };
        let recipe = selected.recipe;
        info!(target, recipe = %recipe.url(), "Recipe selected");

        let scratch = ScratchDir::new(&self.options.scratch_root)?;
        let mut ctx = self.base_context(&scratch)?;
        apply_session(&mut ctx, first, 0);
        ctx.set(vars::TARGET, target);

        let mut notes = Vec::new();
        let mut stages = Vec::new();
        let mut excluded = Vec::new();
        let mut processed_sessions = Vec::new();
        let mut session_successes = 0usize;

        for (index, session) in lights.iter().copied().enumerate() {
            if !recipe_requirements_met(&recipe, session)? {
                notes.push(format!(
                    "session {} ({}) does not meet the recipe's requirements",
                    session.date(),
                    session.key.filter
                ));
                self.metrics.record_session_skipped();
                continue;
            }
            let mut session_ctx = ctx.clone();
            apply_session(&mut session_ctx, session, index);
            let mut ran_any = false;
            for phase in &session_phases {
                if self.is_excluded(&phase.name) {
                    push_unique(&mut excluded, &phase.name);
                    continue;
                }
                let Some(task) = recipe_task(&recipe, &phase.name)? else {
                    continue;
                };
                if !task_accepts_session(&task.value, session) {
                    continue;
                }
                match self.run_stage(&task, Some(session), session_ctx.clone()) {
                    Ok(outcome) => {
                        stages.push(stage_entry(&task.value, &phase.name, &outcome));
                        session_ctx.merge(outcome.patch.clone());
                        ctx.merge(outcome.patch);
                        session_successes += 1;
                        ran_any = true;
                    }
                    Err(err) => match classify(err) {
                        Disposition::NotEnough(note) => {
                            notes.push(format!("session {}: {note}", session.date()));
                            self.metrics.record_session_skipped();
                            break;
                        }
                        Disposition::Abort(err) => return Err(err),
                        Disposition::Skip(note) => {
                            return Ok(ProcessingResult::new(
                                target,
                                lights.len(),
                                Outcome::Skipped,
                                note,
                            ));
                        }
                        Disposition::Fail(note) => {
                            return Ok(ProcessingResult::new(
                                target,
                                lights.len(),
                                Outcome::Failed,
                                note,
                            ));
                        }
                    },
                }
            }
            if ran_any {
                processed_sessions.push(session);
            }
        }

        // Target stages see the earliest session that actually ran.
        let anchor = processed_sessions.first().copied().unwrap_or(first);
        apply_session(&mut ctx, anchor, 0);
        let mut target_successes = 0usize;
        let mut final_output = None;
        for phase in &target_phases {
            if self.is_excluded(&phase.name) {
                push_unique(&mut excluded, &phase.name);
                continue;
            }
            let Some(task) = recipe_task(&recipe, &phase.name)? else {
                continue;
            };
            if session_successes == 0 {
                break;
            }
            match self.run_stage(&task, Some(anchor), ctx.clone()) {
                Ok(outcome) => {
                    ctx.merge(outcome.patch.clone());
                    stages.push(stage_entry(&task.value, &phase.name, &outcome));
                    target_successes += 1;
                    if outcome.output.is_some() {
                        final_output = outcome.output;
                    }
                }
                Err(err) => match classify(err) {
                    Disposition::Abort(err) => return Err(err),
                    Disposition::NotEnough(note) | Disposition::Skip(note) => {
                        return Ok(ProcessingResult::new(
                            target,
                            lights.len(),
                            Outcome::Skipped,
                            note,
                        ));
                    }
                    Disposition::Fail(note) => {
                        return Ok(ProcessingResult::new(
                            target,
                            lights.len(),
                            Outcome::Failed,
                            note,
                        ));
                    }
                },
            }
        }

        if session_successes == 0 || target_successes == 0 {
            let mut note = if session_successes == 0 {
                "no session stage succeeded".to_string()
            } else {
                "no target stage succeeded".to_string()
            };
            if !notes.is_empty() {
                note = format!("{note}; {}", notes.join("; "));
            }
            return Ok(ProcessingResult::new(
                target,
                lights.len(),
                Outcome::Skipped,
                note,
            ));
        }

        if let Some(output) = &final_output {
            let manifest = TargetManifest {
                target: target.to_string(),
                generated_at: Utc::now(),
                recipe: RecipeLock::from_repo(&recipe)?,
                sessions: processed_sessions
                    .iter()
                    .map(|s| SessionEntry::from_session(s))
                    .collect(),
                stages,
                excluded,
                outputs: vec![output.display().to_string()],
            };
            let path = manifest_path(output);
            write_manifest(&manifest, &path)?;
            debug!(manifest = %path.display(), "Manifest written");
        }

        let mut result = ProcessingResult::new(
            target,
            lights.len(),
            Outcome::Success,
            (!notes.is_empty()).then(|| notes.join("; ")),
        );
        result.output = final_output;
        Ok(result)
    }

    /// Runs [`Self::process_target`] for every target with light sessions
    /// matching `query`.
    pub fn process_selection(&mut self, query: Option<&SessionQuery>) -> Result<Vec<ProcessingResult>> {
        let started = Instant::now();
        let mut by_target: BTreeMap<String, Vec<Session>> = BTreeMap::new();
        for session in self.db.search_session(query)? {
            if !session.is_light() || self.is_processed(&session) {
                continue;
            }
            by_target
                .entry(session.target().to_string())
                .or_default()
                .push(session);
        }
        if by_target.is_empty() {
            info!("No light sessions selected");
        }
        let mut results = Vec::with_capacity(by_target.len());
        for (target, sessions) in by_target {
            results.push(self.process_target(&target, &sessions)?);
        }
        self.metrics.record_total_duration(started.elapsed());
        Ok(results)
    }

    fn is_processed(&self, session: &Session) -> bool {
        self.repos
            .repo_by_url(&session.reference.repo_url)
            .map(|repo| repo.is_processed_output())
            .unwrap_or(false)
    }

    /// Generates calibration masters: every `master` phase, in priority
    /// order, over every indexed raw session its recipe accepts. A single
    /// usable input is copied instead of stacked.
    #[instrument(skip(self))]
    pub fn run_master_stages(&mut self) -> Result<Vec<ProcessingResult>> {
        let started = Instant::now();
        let mut results = Vec::new();
        for phase in self.phases_of(PhaseKind::Master) {
            if self.is_excluded(&phase.name) {
                info!(stage = %phase.name, "Stage excluded");
                continue;
            }
            let sessions: Vec<Session> = self
                .db
                .search_session(None)?
                .into_iter()
                .filter(|s| !self.is_processed(s))
                .collect();
            for session in &sessions {
                let Some(selected) = get_recipe_for_session(self.repos, session, &phase)? else {
                    continue;
                };
                let label = format!("{} {} {}", phase.name, session.date(), session.key.filter)
                    .trim_end()
                    .to_string();
                let scratch = ScratchDir::new(&self.options.scratch_root)?;
                let mut ctx = self.base_context(&scratch)?;
                apply_session(&mut ctx, session, 0);
                let result = match self.run_stage_with(&selected.task, Some(session), ctx, true) {
                    Ok(outcome) => {
                        let note = match (outcome.copied, outcome.status) {
                            (true, _) => Some("single input copied".to_string()),
                            (false, StageStatus::Cached) => Some("up to date".to_string()),
                            (false, StageStatus::Ran) => None,
                        };
                        let mut result = ProcessingResult::new(&label, 1, Outcome::Success, note);
                        result.output = outcome.output;
                        result
                    }
                    Err(err) => match classify(err) {
                        Disposition::Abort(err) => return Err(err),
                        Disposition::NotEnough(note) | Disposition::Skip(note) => {
                            ProcessingResult::new(&label, 1, Outcome::Skipped, note)
                        }
                        Disposition::Fail(note) => {
                            ProcessingResult::new(&label, 1, Outcome::Failed, note)
                        }
                    },
                };
                self.metrics.record_target(result.outcome);
                results.push(result);
            }
        }
        self.metrics.record_total_duration(started.elapsed());
        Ok(results)
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}

fn stage_entry(task: &TaskDef, phase: &str, outcome: &StageOutcome) -> StageEntry {
    StageEntry {
        name: task.name.clone(),
        phase: phase.to_string(),
        tool: task.tool.clone(),
        status: if outcome.copied {
            "copied".to_string()
        } else {
            outcome.status.as_str().to_string()
        },
    }
}

/// Session-derived context keys.
pub fn apply_session(ctx: &mut ProcessingContext, session: &Session, index: usize) {
    ctx.set(vars::TARGET, session.target());
    ctx.set(vars::INSTRUMENT, session.meta(keys::INSTRUME).unwrap_or(""));
    ctx.set(vars::DATE, session.date());
    ctx.set(vars::IMAGETYP, session.imagetyp());
    ctx.set(vars::FILTER, session.meta(keys::FILTER).unwrap_or(""));
    ctx.set(vars::SESSION_INDEX, index);
    ctx.set(vars::SESSION_ID, session.id.unwrap_or_default());
}

/// Files matching `pattern`, with FITS headers read where possible.
fn glob_records(pattern: &str) -> Result<Vec<ImageRecord>> {
    let mut records = Vec::new();
    for entry in glob(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))? {
        let path = entry?;
        if !path.is_file() {
            continue;
        }
        let metadata = if is_fits_path(&path) {
            read_header(&path).unwrap_or_default()
        } else {
            BTreeMap::new()
        };
        records.push(ImageRecord::new(String::new(), path, metadata));
    }
    Ok(records)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// True when `output` exists and is strictly newer than every input.
pub fn is_up_to_date(output: &Path, inputs: &[PathBuf]) -> bool {
    let Some(produced) = modified(output) else {
        return false;
    };
    inputs
        .iter()
        .all(|input| modified(input).is_some_and(|changed| changed < produced))
}
