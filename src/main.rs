//! Perles CLI entry point.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use perles::config::Config;
use perles::persist::sessions::{SessionStatus, SessionStore};
use perles::session::SessionRuntime;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "perles", version)]
#[command(about = "Orchestrate a fleet of AI worker agents under one coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session (default when no subcommand is given)
    Run {
        /// The goal handed to the coordinator once all workers are ready
        #[arg(short, long, default_value = "Read #tasks and wait for user direction.")]
        goal: String,
        /// Number of workers to spawn
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Resume a completed, resumable session
    Resume {
        /// Session id from `perles sessions`
        session_id: String,
    },
    /// List sessions
    Sessions {
        /// Only show resumable sessions
        #[arg(short, long)]
        resumable: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "perles=debug" } else { "perles=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = Config::load().context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Run {
        goal: "Read #tasks and wait for user direction.".to_string(),
        workers: None,
    }) {
        Command::Run { goal, workers } => {
            if let Some(workers) = workers {
                config.initial_workers = workers;
            }
            let runtime = SessionRuntime::start(&config)
                .await
                .context("failed to start session")?;
            tracing::info!(session = %runtime.metadata.id, "session started");
            runtime.launch(&goal).await.context("failed to launch fleet")?;
            run_until_complete(runtime).await
        }
        Command::Resume { session_id } => {
            let runtime = SessionRuntime::resume(&config, &session_id)
                .await
                .context("failed to resume session")?;
            tracing::info!(session = %runtime.metadata.id, "session resumed");
            runtime
                .launch("Review the replayed message log in #tasks and continue where the previous session left off.")
                .await
                .context("failed to launch fleet")?;
            run_until_complete(runtime).await
        }
        Command::Sessions { resumable } => {
            let store = SessionStore::new(&config.base_dir, &config.app_name);
            let sessions = if resumable {
                store.list_resumable()
            } else {
                store.list_all()
            };
            if sessions.is_empty() {
                println!("no sessions");
                return Ok(());
            }
            for entry in sessions {
                println!(
                    "{}  {}  workers={}  started={}{}",
                    entry.id,
                    entry.status.as_str(),
                    entry.worker_count,
                    entry.started_at.format("%Y-%m-%d %H:%M:%S"),
                    if entry.resumable { "  [resumable]" } else { "" },
                );
            }
            Ok(())
        }
    }
}

async fn run_until_complete(runtime: SessionRuntime) -> anyhow::Result<()> {
    let outcome = tokio::select! {
        outcome = runtime.wait_complete() => outcome,
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("interrupt received, shutting down");
            None
        }
    };

    let status = match &outcome {
        Some(outcome) if outcome.status == "success" => SessionStatus::Completed,
        Some(_) => SessionStatus::Failed,
        None => SessionStatus::Interrupted,
    };
    if let Some(outcome) = &outcome {
        tracing::info!(status = %outcome.status, summary = %outcome.summary, "workflow complete");
    }
    runtime
        .shutdown(status)
        .await
        .context("failed to shut down session")?;
    Ok(())
}
