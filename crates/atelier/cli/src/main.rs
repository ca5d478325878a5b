//! Atelier CLI - drive one orchestrated run from the terminal
//!
//! Runs use the built-in template planner and the simulated tool backend:
//! - `atelier run` submits a run, advances it until it finishes or parks
//!   for approval, and prints the final snapshot
//! - `atelier config` prints the effective engine configuration

use anyhow::{bail, Context, Result};
use atelier_engine::{AdvanceOutcome, EngineConfig, InMemoryRunStore, Orchestrator, RunManager};
use atelier_types::WorkflowState;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Atelier - guarded Plan/Critique/Execute runs", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, env = "ATELIER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a run and drive it until it settles
    Run {
        /// Intent name (edit_product_shot, batch_variations, composite_scene)
        #[arg(short, long)]
        intent: String,

        /// Constraints as a JSON object
        #[arg(long, default_value = "{}")]
        constraints: String,

        /// Source asset reference
        #[arg(short, long)]
        source: Option<String>,

        /// Approve at the human gate instead of stopping there
        #[arg(long)]
        approve: bool,

        /// Pin the determinism seed
        #[arg(long)]
        seed: Option<u64>,

        /// Also print every event of the run, one JSON object per line
        #[arg(long)]
        events: bool,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time().with_writer(std::io::stderr))
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            intent,
            constraints,
            source,
            approve,
            seed,
            events,
        } => {
            let constraints: Value =
                serde_json::from_str(&constraints).context("--constraints is not valid JSON")?;
            if !constraints.is_object() {
                bail!("--constraints must be a JSON object");
            }
            let mut input = json!({"intent": intent, "constraints": constraints});
            if let Some(source) = source {
                input["source"] = Value::String(source);
            }
            let mut metadata = Map::new();
            if let Some(seed) = seed {
                metadata.insert("seed".into(), Value::from(seed));
            }
            run(config, input, metadata, approve, events).await
        }
        Commands::Config => {
            println!("{}", toml_string(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env().context("reading configuration from environment")?;
    Ok(config)
}

fn toml_string(config: &EngineConfig) -> Result<String> {
    toml::to_string_pretty(config).context("rendering configuration")
}

async fn run(
    config: EngineConfig,
    input: Value,
    metadata: Map<String, Value>,
    approve: bool,
    print_events: bool,
) -> Result<()> {
    let poll_interval = config.poll_interval();
    let orchestrator = Arc::new(Orchestrator::builder(config).build());
    let manager = RunManager::new(
        orchestrator.clone(),
        Arc::new(InMemoryRunStore::new()),
        poll_interval,
    );

    let run_id = manager.submit(input, metadata).await;
    let outcome = manager.run_until_settled(&run_id, approve).await?;
    let snapshot = manager.snapshot(&run_id).await?;
    info!(run_id = %run_id, state = %snapshot.state, ?outcome, "Run settled");

    if print_events {
        for event in orchestrator.events().history(Some(&run_id)) {
            println!("{}", serde_json::to_string(&event)?);
        }
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    match outcome {
        AdvanceOutcome::AwaitingApproval => {
            eprintln!("Run {} is waiting for approval (rerun with --approve)", run_id);
            Ok(())
        }
        _ if snapshot.state == WorkflowState::Completed => Ok(()),
        _ => {
            eprintln!(
                "Run {} ended in {}: {}",
                run_id,
                snapshot.state,
                snapshot.error.as_deref().unwrap_or("no error recorded")
            );
            std::process::exit(1);
        }
    }
}
