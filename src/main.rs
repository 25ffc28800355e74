use anyhow::{Context, Result};
use clap::Parser;
use coursewatch::{
    CanonicalStatus, MultiTracker, Registry, StateChange, TrackOptions, TrackerConfig, WorkflowId,
};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coursewatch")]
#[command(about = "Follow backend workflows over push and polling until they finish")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Workflow ids to follow
    #[arg(required = true)]
    ids: Vec<String>,

    /// Config file (defaults to the user config, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Status endpoint template, `{id}` is replaced by the workflow id
    #[arg(long)]
    status_url: Option<String>,

    /// Push endpoint template, `{id}` is replaced by the workflow id
    #[arg(long)]
    events_url: Option<String>,

    /// Poll interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Poll only, never open push channels
    #[arg(long)]
    no_push: bool,
}

enum Outcome {
    Finished,
    Interrupted,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("COURSEWATCH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<TrackerConfig> {
    let mut config = TrackerConfig::load_or_default(cli.config.as_deref())?;
    if let Some(url) = &cli.status_url {
        config.status_url = url.clone();
    }
    if let Some(url) = &cli.events_url {
        config.events_url = url.clone();
    }
    if let Some(interval) = cli.interval_ms {
        config.poll_interval_ms = interval;
    }
    if cli.no_push {
        config.auto_connect = false;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_change(change: &StateChange) {
    let state = &change.current;
    let mut line = format!(
        "{} {} {}% {} seq={}",
        state.id, state.canonical_status, state.progress_percent, state.connectivity, state.sequence
    );
    if state.degraded {
        line.push_str(" (updates delayed)");
    }
    if let Some(error) = &state.last_error {
        line.push_str(&format!(" error: {}", error));
    }
    println!("{}", line);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let registry = Registry::from_config(config)
        .await
        .context("Failed to start workflow registry")?;
    // Subscribe before tracking so no early transition is missed.
    let mut changes = registry.subscribe_changes();
    let ids: Vec<WorkflowId> = cli.ids.iter().map(|id| WorkflowId::from(id.as_str())).collect();
    let tracker = MultiTracker::track_many(&registry, ids, TrackOptions::new())
        .await
        .context("Failed to track workflows")?;
    let expected = tracker.workflow_ids().len();

    let mut finished: HashMap<WorkflowId, CanonicalStatus> = HashMap::new();
    let outcome = loop {
        if finished.len() == expected {
            break Outcome::Finished;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Outcome::Interrupted,
            change = changes.recv() => match change {
                Ok(change) => {
                    print_change(&change);
                    if change.current.terminal {
                        finished.insert(change.workflow_id.clone(), change.current.canonical_status);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change stream lagged, catching up from snapshots");
                    for (id, state) in tracker.states_by_id() {
                        if state.terminal {
                            finished.insert(id, state.canonical_status);
                        }
                    }
                }
                Err(RecvError::Closed) => break Outcome::Interrupted,
            }
        }
    };

    tracker.disconnect_all();
    registry.shutdown().await;

    match outcome {
        Outcome::Interrupted => {
            tracing::info!(finished = finished.len(), expected, "Interrupted");
            Ok(())
        }
        Outcome::Finished => {
            let unsuccessful: Vec<String> = finished
                .iter()
                .filter(|(_, status)| **status != CanonicalStatus::Completed)
                .map(|(id, status)| format!("{} ({})", id, status))
                .collect();
            if unsuccessful.is_empty() {
                Ok(())
            } else {
                anyhow::bail!("Workflows did not complete: {}", unsuccessful.join(", "))
            }
        }
    }
}
