use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conductor::config::ConductorConfig;
use conductor::persistence::{CheckpointSet, FileSystemPersistence, PersistedRun, StatePersistence};
use conductor::telemetry::init_telemetry;
use conductor::{StateMachineCore, WorkflowRegistry};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Inspect persisted pipeline runs")]
#[command(long_about = "Conductor is the control plane of an autonomous multi-stage pipeline. \
                       This tool reads the state it persists so operators can see where a run \
                       stands and whether it can be resumed. It never modifies run state.")]
struct Cli {
    /// Configuration file (defaults to conductor.toml / .conductor-rc)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the persisted state directory
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the persisted snapshot of a run
    Status {
        run_id: String,
        /// Print the raw stored document
        #[arg(long)]
        json: bool,
    },
    /// Show completed stages against the pipeline total
    Progress { run_id: String },
    /// Report whether a run can be resumed
    CanResume { run_id: String },
    /// List persisted runs
    Runs,
}

fn load_config(cli: &Cli) -> Result<ConductorConfig> {
    let _ = ConductorConfig::load_env_file();
    let mut config = match &cli.config {
        Some(path) => ConductorConfig::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => ConductorConfig::load()?,
    };
    if let Some(state_dir) = &cli.state_dir {
        config.persistence.state_dir = state_dir.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_telemetry(&config.observability)?;

    let store = FileSystemPersistence::new(config.persistence.state_dir.clone());

    match cli.command {
        Commands::Status { run_id, json } => tokio::runtime::Runtime::new()?
            .block_on(async { status_command(&store, &run_id, json).await }),
        Commands::Progress { run_id } => tokio::runtime::Runtime::new()?
            .block_on(async { progress_command(&store, &run_id).await }),
        Commands::CanResume { run_id } => tokio::runtime::Runtime::new()?
            .block_on(async { can_resume_command(config, &run_id).await }),
        Commands::Runs => {
            tokio::runtime::Runtime::new()?.block_on(async { runs_command(&store).await })
        }
    }
}

async fn load_run(store: &FileSystemPersistence, run_id: &str) -> Result<PersistedRun> {
    store
        .load(run_id)
        .await?
        .with_context(|| format!("no persisted state for run '{run_id}' in {}", store.directory().display()))
}

async fn status_command(store: &FileSystemPersistence, run_id: &str, json: bool) -> Result<()> {
    let run = load_run(store, run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    let snapshot = &run.snapshot;
    println!("📋 Run {} ({})", run.run_id, run.host);
    println!("   State:        {}", snapshot.state);
    println!("   Health:       {}", snapshot.health_status);
    println!(
        "   Active stage: {}",
        snapshot.active_stage.as_deref().unwrap_or("none")
    );
    println!("   Saved at:     {}", run.updated_at.to_rfc3339());

    if !snapshot.stages.is_empty() {
        println!();
        println!("Stages:");
        for (name, stage) in &snapshot.stages {
            let circuit = if stage.circuit_open { "  ⛔ circuit open" } else { "" };
            println!(
                "   {name:<20} {:<10} runs={} failures={}{circuit}",
                stage.status.to_string(),
                stage.execution_count,
                stage.failure_count,
            );
        }
    }

    if !snapshot.active_issues.is_empty() {
        println!();
        println!("Active issues:");
        for issue in &snapshot.active_issues {
            println!(
                "   {:<28} {:?} x{}",
                issue.issue_type.to_string(),
                issue.severity,
                issue.occurrences
            );
        }
    }
    Ok(())
}

async fn progress_command(store: &FileSystemPersistence, run_id: &str) -> Result<()> {
    let run = load_run(store, run_id).await?;
    let set = CheckpointSet {
        run_id: run.run_id,
        pipeline: run.pipeline,
        checkpoints: run.checkpoints,
        snapshot: run.snapshot,
    };

    let progress = set.progress();
    println!(
        "{}/{} stages completed ({:.1}%)",
        progress.completed, progress.total, progress.percent
    );
    for stage in set.completed_stages() {
        println!("   ✅ {stage}");
    }
    Ok(())
}

async fn can_resume_command(config: ConductorConfig, run_id: &str) -> Result<()> {
    let core = StateMachineCore::builder(run_id)
        .with_config(config)
        .with_registry(WorkflowRegistry::empty())
        .build()?;
    if core.can_resume(run_id).await {
        println!("yes: run '{run_id}' can be resumed");
    } else {
        println!("no: run '{run_id}' cannot be resumed");
    }
    Ok(())
}

async fn runs_command(store: &FileSystemPersistence) -> Result<()> {
    let runs = store.list_runs().await?;
    if runs.is_empty() {
        println!("No persisted runs in {}", store.directory().display());
        return Ok(());
    }
    for run_id in runs {
        match store.load(&run_id).await {
            Ok(Some(run)) => println!(
                "{run_id:<32} {:<16} {}",
                run.snapshot.state.to_string(),
                run.updated_at.to_rfc3339()
            ),
            Ok(None) => {}
            Err(e) => println!("{run_id:<32} unreadable: {e}"),
        }
    }
    Ok(())
}
