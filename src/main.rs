use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::{Shell, generate};
use stackwright::database::{Database, MemoryDatabase};
use stackwright::indexer::reindex_repo;
use stackwright::observability::{MetricsCollector, log_snapshot};
use stackwright::pipeline::{Orchestrator, ProcessOptions, ProcessingResult};
use stackwright::presets::generate_preset;
use stackwright::repo::RepoManager;
use stackwright::scratch::sweep_stale;
use stackwright::selection::SelectionStore;
use stackwright::session::parse_timestamp;
use stackwright::settings::{Settings, canonical_url};
use stackwright::stage::{all_tasks, load_phases};
use stackwright::tools::ToolRegistry;
use stackwright::validation::validate_config;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    let settings = Settings::resolve(cli.config_dir.as_deref())?;
    match cli.command {
        Commands::Repo { action } => repo_command(&settings, action, cli.force),
        Commands::Select { action } => select_command(&settings, action),
        Commands::Process { action } => process_command(&settings, action, cli.force),
        Commands::Validate => validate_cmd(&settings),
        Commands::Sweep { max_age_hours } => sweep_cmd(&settings, max_age_hours),
        Commands::Info { action } => info_command(&settings, action),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "stackwright", &mut io::stdout());
            Ok(())
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

fn open_database(settings: &Settings) -> Result<MemoryDatabase> {
    MemoryDatabase::open(&settings.database_path())
}

fn repo_command(settings: &Settings, command: RepoCommands, force: bool) -> Result<()> {
    match command {
        RepoCommands::Add { url } => {
            if !settings.add_repo_ref(&url)? {
                info!(repo = %url, "Repo already referenced");
            }
            let canonical = canonical_url(&url)?;
            let repos = settings.load_repos()?;
            let repo = repos
                .repo_by_url(&canonical)
                .ok_or_else(|| anyhow!("Repo {canonical} did not load"))?;
            let mut db = open_database(settings)?;
            let report = reindex_repo(&repo, &mut db, force)?;
            db.save()?;
            println!(
                "{canonical}: {} scanned, {} added, {} failed",
                report.scanned, report.added, report.failed
            );
            Ok(())
        }
        RepoCommands::Remove { url } => {
            let canonical = canonical_url(&url)?;
            if !settings.remove_repo_ref(&url)? {
                bail!("Repo {canonical} is not referenced from {}", settings.user_document().display());
            }
            let mut db = open_database(settings)?;
            db.remove_repo(&canonical)?;
            db.save()?;
            println!("Removed {canonical}");
            Ok(())
        }
        RepoCommands::List => {
            let repos = settings.load_repos()?;
            for (index, repo) in repos.repos().iter().enumerate() {
                println!(
                    "{:>3}  {:<12} {}",
                    index + 1,
                    repo.kind().unwrap_or("-"),
                    repo.url()
                );
            }
            Ok(())
        }
        RepoCommands::Reindex { url } => {
            let repos = settings.load_repos()?;
            let mut db = open_database(settings)?;
            let selected = match url {
                Some(url) => {
                    let canonical = canonical_url(&url)?;
                    vec![
                        repos
                            .repo_by_url(&canonical)
                            .ok_or_else(|| anyhow!("Repo {canonical} is not loaded"))?,
                    ]
                }
                None => repos.repos().to_vec(),
            };
            for repo in selected {
                let report = reindex_repo(&repo, &mut db, force)?;
                if report.scanned > 0 {
                    println!(
                        "{}: {} scanned, {} added, {} unchanged, {} failed",
                        repo.url(),
                        report.scanned,
                        report.added,
                        report.unchanged,
                        report.failed
                    );
                }
            }
            db.save()?;
            Ok(())
        }
        RepoCommands::New { dir, kind } => {
            let written = generate_preset(&kind, &dir)?;
            info!(repo = %written.display(), kind = %kind, "Repo document generated");
            println!("{}", written.display());
            Ok(())
        }
    }
}

fn select_command(settings: &Settings, command: SelectCommands) -> Result<()> {
    let mut store = SelectionStore::load(&settings.selection_path())?;
    match command {
        SelectCommands::Target { name } => store.add_target(&name),
        SelectCommands::Filter { name } => store.add_filter(&name),
        SelectCommands::Date { from, to } => {
            let parse = |raw: Option<String>| -> Result<_> {
                raw.map(|raw| {
                    parse_timestamp(&raw).ok_or_else(|| anyhow!("Unrecognised date '{raw}'"))
                })
                .transpose()
            };
            store.set_dates(parse(from)?, parse(to)?);
        }
        SelectCommands::Clear => store.clear(),
        SelectCommands::List => {
            let db = open_database(settings)?;
            let sessions = db.search_session(store.query())?;
            for session in sessions.iter().filter(|s| s.is_light()) {
                println!(
                    "{}  {:<20} {:<10} {:>4} x {:>7.1}s",
                    session.date(),
                    session.target(),
                    session.key.filter,
                    session.num_images,
                    session.exptime_total
                );
            }
            return Ok(());
        }
    }
    store.save()
}

fn process_command(settings: &Settings, command: ProcessCommands, force: bool) -> Result<()> {
    let repos = settings.load_repos()?;
    let mut options = ProcessOptions::from_config(&repos, settings.scratch_root())?;
    options.force = force;
    let mut db = open_database(settings)?;

    let run = run_process(settings, &repos, &mut db, command, options);
    // Masters registered before an abort are kept.
    let saved = db.save();
    let (results, metrics) = run?;
    saved?;

    print_results(&results);
    log_snapshot(&metrics.snapshot());
    Ok(())
}

fn run_process(
    settings: &Settings,
    repos: &RepoManager,
    db: &mut MemoryDatabase,
    command: ProcessCommands,
    mut options: ProcessOptions,
) -> Result<(Vec<ProcessingResult>, MetricsCollector)> {
    match command {
        ProcessCommands::Masters => {
            let mut orchestrator =
                Orchestrator::new(repos, db, ToolRegistry::with_defaults(), options)?;
            let results = orchestrator.run_master_stages()?;
            Ok((results, orchestrator.metrics()))
        }
        ProcessCommands::Auto { exclude } => {
            options.exclude.extend(exclude);
            let selection = SelectionStore::load(&settings.selection_path())?;
            let mut orchestrator =
                Orchestrator::new(repos, db, ToolRegistry::with_defaults(), options)?;
            let results = orchestrator.process_selection(selection.query())?;
            Ok((results, orchestrator.metrics()))
        }
    }
}

fn print_results(results: &[ProcessingResult]) {
    if results.is_empty() {
        println!("Nothing to process");
        return;
    }
    for result in results {
        println!(
            "{:<28} {:>3}  {:<8} {}",
            result.target,
            result.sessions,
            result.outcome,
            result.note.as_deref().unwrap_or("")
        );
    }
}

fn validate_cmd(settings: &Settings) -> Result<()> {
    let repos = settings.load_repos()?;
    let report = validate_config(&repos, &ToolRegistry::with_defaults());

    for warning in &report.warnings {
        warn!("{warning}");
    }

    if report.is_ok() {
        info!(repos = repos.repos().len(), "Configuration validated successfully");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!("{error_msg}");
        }
        bail!("Configuration has {} error(s)", report.errors.len())
    }
}

fn sweep_cmd(settings: &Settings, max_age_hours: u64) -> Result<()> {
    let removed = sweep_stale(
        &settings.scratch_root(),
        Duration::from_secs(max_age_hours * 3600),
    )?;
    for dir in &removed {
        println!("{}", dir.display());
    }
    info!(removed = removed.len(), "Scratch sweep finished");
    Ok(())
}

fn info_command(settings: &Settings, command: InfoCommands) -> Result<()> {
    match command {
        InfoCommands::Stages => {
            let repos = settings.load_repos()?;
            list_stages(&repos)
        }
        InfoCommands::Tools => {
            println!("Available tools:");
            for name in ToolRegistry::with_defaults().known_tools() {
                println!("- {name}");
            }
            Ok(())
        }
    }
}

fn list_stages(repos: &RepoManager) -> Result<()> {
    let tasks = all_tasks(repos)?;
    for phase in load_phases(repos)? {
        println!(
            "{:>5}  {:<14} {:?}",
            phase.value.priority, phase.value.name, phase.value.kind
        );
        for task in tasks.iter().filter(|t| t.value.when == phase.value.name) {
            println!(
                "         {} ({}) from {}",
                task.value.name,
                task.value.tool,
                task.source.url()
            );
        }
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "stackwright",
    version,
    about = "Astrophotography processing driven by layered repo documents"
)]
struct Cli {
    /// Directory holding the user repo, image index and scratch space.
    #[arg(long, global = true, env = "STACKWRIGHT_HOME", value_hint = ValueHint::DirPath)]
    config_dir: Option<PathBuf>,
    /// Re-run stages and re-read images even when nothing changed.
    #[arg(long, global = true)]
    force: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Repo {
        #[command(subcommand)]
        action: RepoCommands,
    },
    Select {
        #[command(subcommand)]
        action: SelectCommands,
    },
    Process {
        #[command(subcommand)]
        action: ProcessCommands,
    },
    /// Checks the merged configuration without running anything.
    Validate,
    /// Removes scratch directories left behind by interrupted runs.
    Sweep {
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
    Info {
        #[command(subcommand)]
        action: InfoCommands,
    },
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// References a repo from the user repo and indexes its images.
    Add { url: String },
    Remove { url: String },
    List,
    Reindex { url: Option<String> },
    /// Writes a starter repo document.
    New {
        #[arg(value_hint = ValueHint::DirPath)]
        dir: PathBuf,
        /// One of raw, master, processed or recipe.
        #[arg(long)]
        kind: String,
    },
}

#[derive(Subcommand)]
enum SelectCommands {
    Target { name: String },
    Filter { name: String },
    Date {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    Clear,
    List,
}

#[derive(Subcommand)]
enum ProcessCommands {
    /// Builds calibration masters from every indexed session.
    Masters,
    /// Processes every selected target.
    Auto {
        #[arg(long)]
        exclude: Vec<String>,
    },
}

#[derive(Subcommand)]
enum InfoCommands {
    Stages,
    Tools,
}
