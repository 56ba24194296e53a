//! NDJSON subprocess agent backend.
//!
//! Spawns one agent process per invocation. The prompt is written to stdin
//! as the first line; the process answers with one [`BackendEvent`] per
//! stdout line and receives permission answers on stdin.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{
    AgentBackend, BackendError, BackendEvent, Invocation, InvocationContext, InvocationHandle,
};
use crate::permission::PermissionDecision;

/// Lines written to the agent's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentInput<'a> {
    Prompt {
        session_id: &'a str,
        task_id: &'a str,
        prompt: &'a str,
    },
    PermissionResponse {
        tool_call_id: &'a str,
        allow: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'a str>,
    },
}

/// Agent backend that runs an external program speaking NDJSON.
#[derive(Debug, Clone)]
pub struct SubprocessBackend {
    program: PathBuf,
    args: Vec<String>,
    /// How long to wait for the process to exit after it was killed.
    terminate_timeout: Duration,
}

impl SubprocessBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            terminate_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    fn resolve_working_dir(requested: Option<&Path>) -> Option<PathBuf> {
        let requested = requested?;
        if !requested.as_os_str().is_empty() && requested.exists() {
            return Some(requested.to_path_buf());
        }
        let fallback = dirs::home_dir().unwrap_or_else(|| {
            warn!("dirs::home_dir() returned None; falling back to temp_dir for working directory");
            std::env::temp_dir()
        });
        warn!(
            requested = %requested.display(),
            fallback = %fallback.display(),
            "Working directory missing or empty, using fallback"
        );
        Some(fallback)
    }
}

#[async_trait]
impl AgentBackend for SubprocessBackend {
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        prompt: &str,
    ) -> Result<Invocation, BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("TASKFLOW_SESSION_ID", &ctx.session_id)
            .env("TASKFLOW_TASK_ID", &ctx.task_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = Self::resolve_working_dir(ctx.working_directory.as_deref()) {
            cmd.current_dir(dir);
        }

        info!(
            session_id = %ctx.session_id,
            task_id = %ctx.task_id,
            program = %self.program.display(),
            "Spawning agent subprocess"
        );
        let mut child = cmd.spawn().map_err(|e| BackendError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| BackendError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        let stdin_tx = spawn_stdin_writer(stdin, ctx.task_id.clone());
        let first_line = serde_json::to_string(&AgentInput::Prompt {
            session_id: &ctx.session_id,
            task_id: &ctx.task_id,
            prompt,
        })?;
        stdin_tx
            .send(first_line)
            .await
            .map_err(|_| BackendError::Closed)?;

        if let Some(stderr) = child.stderr.take() {
            let task_id = ctx.task_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(task_id = %task_id, "stderr: {}", line);
                }
                debug!(task_id = %task_id, "stderr reader finished");
            });
        }

        let kill = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(read_events(
            child,
            stdout,
            event_tx,
            kill.clone(),
            self.terminate_timeout,
            ctx.task_id.clone(),
        ));

        Ok(Invocation {
            events: Box::pin(ReceiverStream::new(event_rx)),
            handle: Arc::new(SubprocessHandle { stdin_tx, kill }),
        })
    }
}

fn spawn_stdin_writer(stdin: ChildStdin, task_id: String) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(32);
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(line) = rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!(task_id = %task_id, "Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!(task_id = %task_id, "Failed to write newline: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!(task_id = %task_id, "Failed to flush stdin: {}", e);
                break;
            }
        }
    });
    tx
}

async fn read_events(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    tx: mpsc::Sender<Result<BackendEvent, BackendError>>,
    kill: CancellationToken,
    terminate_timeout: Duration,
    task_id: String,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            () = kill.cancelled() => {
                terminate(&mut child, terminate_timeout, &task_id).await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<BackendEvent>(&line) {
                        Ok(BackendEvent::Unknown) => {
                            debug!(task_id = %task_id, "Skipping unknown agent event");
                        }
                        Ok(event) => {
                            if tx.send(Ok(event)).await.is_err() {
                                warn!(task_id = %task_id, "Event receiver dropped");
                                terminate(&mut child, terminate_timeout, &task_id).await;
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "Malformed agent line");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(BackendError::Io(e))).await;
                    break;
                }
            }
        }
    }

    tokio::select! {
        () = kill.cancelled() => terminate(&mut child, terminate_timeout, &task_id).await,
        status = child.wait() => match status {
            Ok(status) if status.success() => {
                debug!(task_id = %task_id, "Agent exited");
            }
            Ok(status) => {
                let _ = tx.send(Err(BackendError::Exited { code: status.code() })).await;
            }
            Err(e) => {
                let _ = tx.send(Err(BackendError::Io(e))).await;
            }
        }
    }
}

async fn terminate(child: &mut Child, timeout: Duration, task_id: &str) {
    if let Err(e) = child.start_kill() {
        debug!(task_id, error = %e, "Agent already gone");
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => info!(task_id, ?status, "Agent terminated"),
        Ok(Err(e)) => warn!(task_id, error = %e, "Error waiting for agent"),
        Err(_) => warn!(task_id, "Timeout waiting for agent to exit"),
    }
}

struct SubprocessHandle {
    stdin_tx: mpsc::Sender<String>,
    kill: CancellationToken,
}

#[async_trait]
impl InvocationHandle for SubprocessHandle {
    async fn cancel(&self) -> Result<(), BackendError> {
        self.kill.cancel();
        Ok(())
    }

    async fn respond_permission(
        &self,
        tool_call_id: &str,
        decision: &PermissionDecision,
    ) -> Result<(), BackendError> {
        let line = serde_json::to_string(&AgentInput::PermissionResponse {
            tool_call_id,
            allow: decision.allow,
            reason: decision.reason.as_deref(),
        })?;
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| BackendError::Closed)
    }
}
