//! `taskflow` daemon
//!
//! Runs prompts through an agent subprocess with permission gating,
//! stop handling and parent callbacks, and recovers orphaned tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use taskflow_core::Config;
use taskflow_daemon::backend::SubprocessBackend;
use taskflow_daemon::orchestration::{Orchestrator, OrchestratorConfig};
use taskflow_daemon::permission::{PermissionDecision, PermissionEvent};
use taskflow_daemon::storage::{Database, DatabaseError, NewSession};

#[derive(Parser, Debug)]
#[command(name = "taskflow-daemon")]
#[command(version, about = "taskflow daemon - session task orchestration")]
struct Args {
    /// Database file path
    #[arg(long, global = true, env = "TASKFLOW_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Project directory whose `.taskflow/settings.json` is merged into the config
    #[arg(long, global = true, env = "TASKFLOW_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true, env = "TASKFLOW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "TASKFLOW_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fail tasks left running by a previous process.
    Recover,

    /// Run one prompt through an agent subprocess.
    Run {
        /// Session to run in; created if it does not exist
        #[arg(long)]
        session: Option<String>,

        /// Prompt text
        #[arg(long)]
        prompt: String,

        /// Agent program speaking the NDJSON event protocol
        #[arg(long, env = "TASKFLOW_AGENT_BIN")]
        agent_bin: PathBuf,

        /// Extra argument passed to the agent (repeatable)
        #[arg(long = "agent-arg")]
        agent_args: Vec<String>,

        /// User the prompt is submitted as
        #[arg(long, env = "TASKFLOW_USER")]
        user: Option<String>,

        /// Allow every permission request
        #[arg(long, conflicts_with = "deny_all")]
        approve_all: bool,

        /// Deny every permission request
        #[arg(long)]
        deny_all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = taskflow_core::config::load_config(args.project_dir.as_deref())?;
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }
    let level = &config.daemon.log_level;
    taskflow_core::tracing_init::init_tracing(
        &format!("taskflow_daemon={level},taskflow_core={level}"),
        args.log_json,
    );

    info!(version = env!("CARGO_PKG_VERSION"), "Starting taskflow-daemon");

    let db = Arc::new(open_database(&args, &config).await?);

    match args.command {
        Command::Recover => {
            let orchestrator = Orchestrator::new(
                db,
                Arc::new(SubprocessBackend::new("true")),
                OrchestratorConfig::from(&config),
            );
            let recovered = orchestrator.recover_orphaned().await?;
            info!(recovered, "Recovery complete");
        }
        Command::Run {
            session,
            prompt,
            agent_bin,
            agent_args,
            user,
            approve_all,
            deny_all,
        } => {
            let backend = SubprocessBackend::new(agent_bin).with_args(agent_args);
            let orchestrator =
                Orchestrator::new(db.clone(), Arc::new(backend), OrchestratorConfig::from(&config));
            orchestrator.recover_orphaned().await?;

            let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            match db.get_session(&session_id).await {
                Ok(_) => {}
                Err(DatabaseError::NotFound(_)) => {
                    orchestrator
                        .create_session(NewSession {
                            id: session_id.clone(),
                            created_by: user.clone(),
                            ..Default::default()
                        })
                        .await?;
                    info!(session_id = %session_id, "Session created");
                }
                Err(e) => return Err(e.into()),
            }

            let policy = if approve_all {
                Some(true)
            } else if deny_all {
                Some(false)
            } else {
                None
            };
            if let Some(allow) = policy {
                spawn_decision_policy(&orchestrator, allow);
            } else {
                warn!("No permission policy; permission requests will time out");
            }

            let task_id = orchestrator
                .submit_prompt(&session_id, &prompt, user.as_deref())
                .await?;
            info!(session_id = %session_id, task_id = %task_id, "Running prompt");

            let poll = OrchestratorConfig::from(&config).poll_interval;
            tokio::select! {
                () = wait_until_idle(&orchestrator, &session_id, poll) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, stopping session");
                    let result = orchestrator.stop(&session_id).await;
                    info!(success = result.success, reason = ?result.reason, "Stop finished");
                }
            }

            let task = db.get_task(&task_id).await?;
            info!(
                task_id = %task.id,
                status = %task.status,
                duration_ms = ?task.duration_ms,
                tool_use_count = task.tool_use_count,
                report = ?task.report,
                error = ?task.error,
                "Task finished"
            );
        }
    }

    Ok(())
}

async fn open_database(args: &Args, config: &Config) -> anyhow::Result<Database> {
    let path = match args
        .db_path
        .clone()
        .or_else(|| config.daemon.database_path.clone())
    {
        Some(path) => path,
        None => default_db_path()?,
    };
    info!(path = %path.display(), "Opening database");
    Ok(Database::open(&path).await?)
}

/// Default database path: the config directory, else ~/.taskflow/taskflow.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = taskflow_core::config::database_path() {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".taskflow").join("taskflow.db"))
}

/// Answer every permission request with `allow`.
fn spawn_decision_policy(orchestrator: &Arc<Orchestrator>, allow: bool) {
    let mut events = orchestrator.subscribe_permissions();
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PermissionEvent::Requested(request)) => {
                    info!(
                        request_id = %request.request_id,
                        tool_name = %request.tool_name,
                        allow,
                        "Answering permission request"
                    );
                    let decision = PermissionDecision::once(&request.request_id, allow, "cli");
                    if let Err(e) = orchestrator.decide(decision).await {
                        error!(error = %e, "Failed to deliver permission decision");
                    }
                }
                Ok(PermissionEvent::Resolved { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Permission event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_until_idle(orchestrator: &Orchestrator, session_id: &str, poll: Duration) {
    let mut ticker = tokio::time::interval(poll);
    loop {
        ticker.tick().await;
        let running = orchestrator.get_running().await;
        if !running.iter().any(|r| r.session_id == session_id) {
            return;
        }
    }
}
