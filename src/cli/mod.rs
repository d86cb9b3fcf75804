//! Command-line interface for huntarr.
//!
//! `serve` runs the orchestrator and HTTP API; the other commands inspect
//! the database directly.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use tracing::{info, warn};

use crate::adapters::{Automation, HttpAutomation, NullAutomation};
use crate::api::{build_router, ApiState};
use crate::config::{self, ResolvedConfig};
use crate::core::{Orchestrator, OrchestratorSettings};
use crate::domain::{ManualActionFilter, ManualActionStatus, Run};
use crate::pipeline::hunt_registry;
use crate::store::Store;

/// huntarr - Job-application run orchestrator
#[derive(Parser, Debug)]
#[command(name = "huntarr")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the orchestrator and HTTP API
    Serve {
        /// Address to bind to (overrides HUNTARR_ADDR and the config file)
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the status of a run
    Status {
        /// Run ID
        run_id: String,
    },

    /// Print a run's events
    Events {
        /// Run ID
        run_id: String,

        /// Only events after this id
        #[arg(long, default_value = "0")]
        after: i64,

        /// Maximum number of events to show
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// List manual actions
    Manual {
        /// Filter by status (pending or resolved)
        #[arg(short, long)]
        status: Option<ManualActionStatus>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { addr } => serve(addr).await,
            Commands::Runs { limit } => list_runs(limit),
            Commands::Status { run_id } => show_status(&run_id),
            Commands::Events {
                run_id,
                after,
                limit,
            } => show_events(&run_id, after, limit),
            Commands::Manual { status } => list_manual_actions(status),
            Commands::Config => show_config(),
        }
    }
}

fn automation_for(cfg: &ResolvedConfig) -> Result<Arc<dyn Automation>> {
    match &cfg.automation_url {
        Some(url) => {
            let automation = HttpAutomation::new(url.as_str(), cfg.automation_timeout)
                .with_context(|| format!("Failed to configure automation service at {}", url))?;
            Ok(Arc::new(automation))
        }
        None => {
            warn!("HUNTARR_AUTOMATION_URL not set, runs will discover no jobs");
            Ok(Arc::new(NullAutomation))
        }
    }
}

/// Open the configured database with an orchestrator that never drives runs
fn open_readonly() -> Result<Arc<Orchestrator>> {
    let cfg = config::config()?;
    let store = Store::open(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?;
    let registry = hunt_registry(Arc::new(NullAutomation))?;
    let settings = OrchestratorSettings {
        auto_drive: false,
        ..cfg.orchestrator_settings()
    };
    Ok(Orchestrator::new(Arc::new(store), registry, settings))
}

/// Run the HTTP server until Ctrl-C
async fn serve(addr: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let addr = addr.unwrap_or_else(|| cfg.addr.clone());

    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create home directory: {}", cfg.home.display()))?;

    // Single writer per database
    let lock_path = cfg.lock_path();
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
    lock_file.try_lock_exclusive().with_context(|| {
        format!(
            "Another huntarr process holds {}; only one server may use a database",
            lock_path.display()
        )
    })?;

    let store = Store::open(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?;
    let registry = hunt_registry(automation_for(cfg)?)?;
    let orchestrator = Orchestrator::new(Arc::new(store), registry, cfg.orchestrator_settings());

    let recovered = orchestrator.recover()?;
    let router = build_router(ApiState::new(orchestrator));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(
        %addr,
        database = %cfg.database.display(),
        recovered,
        "huntarr listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        })
        .await
        .context("HTTP server error")?;

    // Lock is released when the file is dropped
    drop(lock_file);
    Ok(())
}

fn list_runs(limit: usize) -> Result<()> {
    let runs = open_readonly()?.list_runs(limit)?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<10} {:<20} {:>8} {:>8}",
        "RUN ID", "MODE", "STATUS", "NODE", "APPLIED", "MANUAL"
    );
    println!("{}", "-".repeat(99));

    for run in runs {
        println!(
            "{:<38} {:<10} {:<10} {:<20} {:>8} {:>8}",
            run.id,
            run.mode.as_str(),
            run.status.as_str(),
            run.current_node.as_deref().unwrap_or("-"),
            run.metrics.applied,
            run.metrics.manual_required
        );
    }

    Ok(())
}

fn print_run(run: &Run) {
    println!("Run ID: {}", run.id);
    println!("Mode: {}", run.mode.as_str());
    println!("Status: {}", run.status);
    println!("Current node: {}", run.current_node.as_deref().unwrap_or("-"));
    println!("Created: {}", run.created_at);
    if let Some(started) = run.started_at {
        println!("Started: {}", started);
    }
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if run.operator_paused {
        println!("Paused by operator");
    }
    if let Some(action_id) = &run.blocked_by_manual_action {
        println!("Blocked by manual action: {}", action_id);
    }
    if let Some(error) = &run.error {
        println!("Error: {}", error);
    }
    println!("\nMetrics:");
    println!("  discovered:      {}", run.metrics.discovered);
    println!("  applied:         {}", run.metrics.applied);
    println!("  failed:          {}", run.metrics.failed);
    println!("  skipped:         {}", run.metrics.skipped);
    println!("  manual_required: {}", run.metrics.manual_required);
    println!("  node executions: {}", run.node_executions);
}

fn show_status(run_id: &str) -> Result<()> {
    let run = open_readonly()?.get_run(run_id)?;
    print_run(&run);
    Ok(())
}

fn show_events(run_id: &str, after: i64, limit: usize) -> Result<()> {
    let events = open_readonly()?
        .event_log()
        .batch(run_id, after, limit)?;

    for event in events {
        println!(
            "{:>5} {} {:<7} {:<20} {:<24} {}",
            event.id,
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
            event.level.as_str(),
            event.node.as_deref().unwrap_or("-"),
            event.event_type,
            event.message
        );
    }

    Ok(())
}

fn list_manual_actions(status: Option<ManualActionStatus>) -> Result<()> {
    let filter = ManualActionFilter {
        status,
        run_id: None,
    };
    let actions = open_readonly()?.manual_queue().list(&filter, 200)?;

    if actions.is_empty() {
        println!("No manual actions found");
        return Ok(());
    }

    println!(
        "{:<38} {:<38} {:<16} {:<9} {}",
        "ACTION ID", "RUN ID", "TYPE", "STATUS", "JOB"
    );
    println!("{}", "-".repeat(120));

    for action in actions {
        let job = match (&action.company, &action.title) {
            (Some(company), Some(title)) => format!("{} @ {}", title, company),
            _ => action.job_id.clone().unwrap_or_else(|| "-".to_string()),
        };
        println!(
            "{:<38} {:<38} {:<16} {:<9} {}",
            action.id,
            action.run_id,
            action.action_type,
            action.status.as_str(),
            job
        );
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("huntarr configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!("  Lock:     {}", cfg.lock_path().display());
    println!();
    println!("Server:");
    println!("  Address:        {}", cfg.addr);
    println!("  Manual session: {}", cfg.session_url);
    println!(
        "  Automation:     {}",
        cfg.automation_url.as_deref().unwrap_or("(none - null automation)")
    );
    println!("  Automation timeout: {}s", cfg.automation_timeout.as_secs());
    println!();
    println!("Execution limits:");
    println!("  Node timeout:        {}s", cfg.limits.node_timeout_seconds);
    for (node, seconds) in &cfg.limits.node_timeouts {
        println!("    {}: {}s", node, seconds);
    }
    println!("  Max node executions: {}", cfg.limits.max_node_executions);
    println!(
        "  Commit retry:        {} attempts, {}ms initial, {}ms max",
        cfg.limits.commit_retry.max_attempts,
        cfg.limits.commit_retry.initial_delay_ms,
        cfg.limits.commit_retry.max_delay_ms
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_and_events() {
        let cli = Cli::try_parse_from(["huntarr", "serve", "--addr", "0.0.0.0:9000"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { addr: Some(ref a) } if a == "0.0.0.0:9000"));

        let cli = Cli::try_parse_from(["huntarr", "events", "run-1", "--after", "5"]).unwrap();
        match cli.command {
            Commands::Events {
                run_id,
                after,
                limit,
            } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(after, 5);
                assert_eq!(limit, 100);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_manual_status_filter_parses() {
        let cli = Cli::try_parse_from(["huntarr", "manual", "--status", "pending"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Manual {
                status: Some(ManualActionStatus::Pending)
            }
        ));
        assert!(Cli::try_parse_from(["huntarr", "manual", "--status", "bogus"]).is_err());
    }
}
