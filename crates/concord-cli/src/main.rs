//! `concord` command line: list configured agents or run a simulated demo batch.

mod simulated;

use chrono::Utc;
use clap::{Parser, Subcommand};
use concord_core::payload_from;
use concord_orchestrator::{
    CollaborationMode, FileTaskStore, MemoryTaskStore, Orchestrator, OrchestratorConfig,
    TaskPriority, TaskStore, TaskSubmission, TaskType,
};
use serde_json::json;
use simulated::SimulatedWorker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "concord", about = "Concord - multi-agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "concord.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configured agents as JSON
    Agents,
    /// Run a batch of tasks against simulated agents
    Demo {
        /// Number of tasks to submit
        #[arg(short, long, default_value_t = 20)]
        tasks: usize,
        /// Multiplier applied to every agent's response time
        #[arg(long, default_value_t = 0.05)]
        time_scale: f64,
        /// Mirror task records into this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Never fail simulated agent calls
        #[arg(long)]
        no_failures: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = OrchestratorConfig::load(&cli.config).map_err(|e| {
        anyhow::anyhow!("Failed to load config file '{}': {e}", cli.config.display())
    })?;

    match cli.command {
        Commands::Agents => {
            let orchestrator = Orchestrator::new(
                config.clone(),
                Arc::new(SimulatedWorker::new(config.agents.iter().cloned(), 0.0)),
            )?;
            println!("{}", serde_json::to_string_pretty(&orchestrator.get_agent_status())?);
        }
        Commands::Demo {
            tasks,
            time_scale,
            data_dir,
            no_failures,
            timeout_secs,
        } => {
            let store: Arc<dyn TaskStore> = match data_dir {
                Some(dir) => Arc::new(FileTaskStore::new(dir).await?),
                None => Arc::new(MemoryTaskStore::new()),
            };
            let mut worker = SimulatedWorker::new(config.agents.iter().cloned(), time_scale);
            if no_failures {
                worker = worker.without_failures();
            }

            let orchestrator = Orchestrator::with_store(config, Arc::new(worker), store)?;
            let handle = orchestrator.start();

            for i in 0..tasks {
                orchestrator.submit_task(demo_submission(i)).await?;
            }
            info!(tasks, "Demo batch submitted");

            let finished = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
                while !orchestrator.is_idle().await {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await
            .is_ok();
            if !finished {
                warn!(timeout_secs, "Demo batch did not finish in time");
            }
            handle.shutdown().await;

            let report = json!({
                "statistics": orchestrator.get_statistics().await,
                "agents": orchestrator.get_agent_status(),
                "collaborations": orchestrator.collaboration_history().len(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// The `i`-th task of the demo batch. Cycles through every task type,
/// priority and collaboration mode; every fifth task gets a short deadline.
fn demo_submission(i: usize) -> TaskSubmission {
    const MODES: [CollaborationMode; 4] = [
        CollaborationMode::Sequential,
        CollaborationMode::Parallel,
        CollaborationMode::Hierarchical,
        CollaborationMode::Consensus,
    ];

    let task_type = TaskType::ALL[i % TaskType::ALL.len()];
    let priority = TaskPriority::ALL[i % TaskPriority::ALL.len()];
    let mode = MODES[i % MODES.len()];

    let submission = TaskSubmission::new(
        task_type,
        format!("Demo {task_type} #{i}"),
        format!("Simulated {mode} request"),
        "demo",
        payload_from(json!({ "sequence": i, "note": "synthetic demo input" })),
    )
    .with_priority(priority)
    .with_mode(mode);

    if i % 5 == 4 {
        submission.with_deadline(Utc::now() + chrono::Duration::seconds(2))
    } else {
        submission
    }
}
