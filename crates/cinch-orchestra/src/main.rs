//! Plan and run an orchestration request against a directory of agent
//! modules, printing the result as JSON.
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `info` filter);
//! stdout carries only the JSON plan or output.
//!
//! # Examples
//!
//! ```sh
//! # Run a request against ./agents
//! cinch-orchestra --modules agents --request "Admin dashboard with RBAC"
//!
//! # Add structured features and platform constraints
//! cinch-orchestra --request "Inventory admin" \
//!   --feature "audit log" --feature "csv export" --platform postgres
//!
//! # Show the plan without loading anything
//! cinch-orchestra --request "Admin panel" --plan-only
//!
//! # Checkpoint each phase, then resume a failed run
//! cinch-orchestra --request "Admin panel" --checkpoint-dir .orchestra/runs
//! cinch-orchestra --checkpoint-dir .orchestra/runs --resume run-18c4f2a9b3e-0000
//! ```

use cinch_orchestra::config::OrchestraConfig;
use cinch_orchestra::events::LoggingHandler;
use cinch_orchestra::modules::DirectorySource;
use cinch_orchestra::orchestrator::{OrchestrationOutput, Orchestrator};
use cinch_orchestra::request::OrchestrationRequest;
use cinch_orchestra::{OrchestraError, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Plan and run a context-budgeted orchestration request.
#[derive(Parser)]
#[command(name = "cinch-orchestra")]
struct Cli {
    // ── Input ──────────────────────────────────────────────────
    /// Request text
    #[arg(long)]
    request: Option<String>,

    /// JSON request file ({"text", "features", "platform"})
    #[arg(long, conflicts_with = "request")]
    request_file: Option<PathBuf>,

    /// Feature to include (repeatable)
    #[arg(long)]
    feature: Vec<String>,

    /// Platform constraint (repeatable)
    #[arg(long)]
    platform: Vec<String>,

    // ── Modules and config ─────────────────────────────────────
    /// Directory of `<team>/<agent>.md` module files
    #[arg(long, default_value = "agents")]
    modules: PathBuf,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Module budget capacity in units (overrides the config file)
    #[arg(long)]
    capacity: Option<u64>,

    /// Directory for run checkpoints
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    // ── Modes ──────────────────────────────────────────────────
    /// Print the execution plan and exit
    #[arg(long)]
    plan_only: bool,

    /// Resume a checkpointed run by id
    #[arg(long, requires = "checkpoint_dir")]
    resume: Option<String>,

    /// Print the request JSON Schema and exit
    #[arg(long)]
    print_schema: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<OrchestraConfig> {
    let mut config = match &cli.config {
        Some(path) => OrchestraConfig::from_json_file(path)?,
        None => OrchestraConfig::default(),
    };
    if let Some(capacity) = cli.capacity {
        config = config.with_capacity(capacity);
    }
    if let Some(dir) = &cli.checkpoint_dir {
        config = config.with_checkpoint_dir(dir);
    }
    Ok(config)
}

fn build_request(cli: &Cli) -> Result<OrchestrationRequest> {
    let mut request = match (&cli.request, &cli.request_file) {
        (Some(text), None) => OrchestrationRequest::new(text),
        (None, Some(path)) => OrchestrationRequest::from_json(&std::fs::read_to_string(path)?)?,
        (None, None) if !cli.feature.is_empty() => OrchestrationRequest::new(""),
        _ => {
            return Err(OrchestraError::InvalidRequest(
                "provide --request, --request-file, or at least one --feature".into(),
            ));
        }
    };
    request.features.extend(cli.feature.iter().cloned());
    request.platform.extend(cli.platform.iter().cloned());
    Ok(request)
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: &Cli) -> Result<bool> {
    if cli.print_schema {
        print_json(&OrchestrationRequest::schema())?;
        return Ok(true);
    }

    let config = load_config(cli)?;
    let source = Arc::new(DirectorySource::new(&cli.modules));
    let orchestrator = Orchestrator::new(config, source)?.with_event_handler(LoggingHandler);

    if let Some(run_id) = &cli.resume {
        let output = orchestrator.resume(run_id).await?;
        print_json(&output)?;
        return Ok(output.success);
    }

    let request = build_request(cli)?;
    if cli.plan_only {
        let plan = orchestrator.create_execution_plan(&request)?;
        print_json(&plan)?;
        return Ok(true);
    }

    let output: OrchestrationOutput = orchestrator.execute_request(&request).await;
    print_json(&output)?;
    Ok(output.success)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
