//! Execution driver: the boundary to the coding agent.
//!
//! The engine never talks to an agent directly. It submits an
//! `ExecutionRequest` and gets back an `ExecutionHandle` with a live output
//! stream, a cancellation token and the final exit status.

use crate::config::Config;
use crate::core::event::OutputStream;
use crate::core::task::{IsolationMode, TaskId};
use crate::error::{Error, ExecutionError, Result};
use crate::orchestration::context::TaskContext;
use crate::util::expand_workspace;
use crate::{clog_debug, clog_warn};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const OUTPUT_CHANNEL_SIZE: usize = 1024;

/// How an agent process ended: `Ok(code)` when it exited (`None` when
/// killed by a signal), `Err` when it never ran or was stopped.
pub type ExitStatus = std::result::Result<Option<i32>, ExecutionError>;

/// One attempt's worth of work for the driver.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub attempt: u32,
    pub context: TaskContext,
    /// Directory the agent works in: the attempt's own worktree.
    pub workspace: PathBuf,
    pub isolation: IsolationMode,
}

impl ExecutionRequest {
    pub fn prompt(&self) -> String {
        self.context.render()
    }
}

/// A line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// Live view of a submitted attempt.
pub struct ExecutionHandle {
    output: mpsc::Receiver<OutputChunk>,
    exit: oneshot::Receiver<ExitStatus>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn new(
        output: mpsc::Receiver<OutputChunk>,
        exit: oneshot::Receiver<ExitStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            output,
            exit,
            cancel,
        }
    }

    /// Stop the attempt. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<OutputChunk>,
        oneshot::Receiver<ExitStatus>,
        CancellationToken,
    ) {
        (self.output, self.exit, self.cancel)
    }
}

/// Runs coding agents. Implementations must stop the agent once `cancel`
/// fires and then report `Err(ExecutionError::Cancelled)` (or the real exit
/// status if it already exited).
pub trait ExecutionDriver: Send + Sync {
    fn name(&self) -> &str;

    fn submit(&self, request: ExecutionRequest, cancel: CancellationToken) -> Result<ExecutionHandle>;
}

/// Launches a configured agent command through `sh -c`, feeding the prompt
/// on stdin.
///
/// `container` and `sandbox` isolation prefix the agent command with the
/// configured wrapper, where `{workspace}` stands for the attempt worktree.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    agent_command: String,
    container_wrapper: String,
    sandbox_wrapper: String,
}

impl CommandDriver {
    pub fn new(agent_command: impl Into<String>) -> Self {
        Self {
            agent_command: agent_command.into(),
            container_wrapper: crate::config::DEFAULT_CONTAINER_WRAPPER.to_string(),
            sandbox_wrapper: crate::config::DEFAULT_SANDBOX_WRAPPER.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            agent_command: config.effective_agent_command().to_string(),
            container_wrapper: config.effective_container_wrapper().to_string(),
            sandbox_wrapper: config.effective_sandbox_wrapper().to_string(),
        }
    }

    pub fn with_container_wrapper(mut self, wrapper: impl Into<String>) -> Self {
        self.container_wrapper = wrapper.into();
        self
    }

    pub fn with_sandbox_wrapper(mut self, wrapper: impl Into<String>) -> Self {
        self.sandbox_wrapper = wrapper.into();
        self
    }

    /// The shell line run for `isolation` in `workspace`.
    pub fn command_line(&self, isolation: IsolationMode, workspace: &std::path::Path) -> String {
        match isolation {
            IsolationMode::Direct => self.agent_command.clone(),
            IsolationMode::Container => format!(
                "{} {}",
                expand_workspace(&self.container_wrapper, workspace),
                self.agent_command
            ),
            IsolationMode::Sandbox => format!(
                "{} {}",
                expand_workspace(&self.sandbox_wrapper, workspace),
                self.agent_command
            ),
        }
    }

    /// Check that the programs needed for `isolation` are on `PATH`.
    pub fn check_available(&self, isolation: IsolationMode) -> Result<()> {
        let mut programs = vec![first_word(&self.agent_command)];
        match isolation {
            IsolationMode::Direct => {}
            IsolationMode::Container => programs.push(first_word(&self.container_wrapper)),
            IsolationMode::Sandbox => programs.push(first_word(&self.sandbox_wrapper)),
        }
        for program in programs.into_iter().flatten() {
            which::which(program).map_err(|_| Error::AgentNotAvailable(program.to_string()))?;
        }
        Ok(())
    }
}

fn first_word(command: &str) -> Option<&str> {
    command.split_whitespace().next()
}

impl ExecutionDriver for CommandDriver {
    fn name(&self) -> &str {
        "command"
    }

    fn submit(&self, request: ExecutionRequest, cancel: CancellationToken) -> Result<ExecutionHandle> {
        let line = self.command_line(request.isolation, &request.workspace);
        clog_debug!(
            "CommandDriver::submit task={} attempt={} isolation={} cmd={}",
            request.task_id,
            request.attempt,
            request.isolation,
            line
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&line)
            .current_dir(&request.workspace)
            .env("CONDUCTOR_TASK_ID", request.task_id.as_str())
            .env("CONDUCTOR_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Spawn(format!("{}: {}", line, e)))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    clog_warn!("Failed to write prompt to agent stdin: {}", e);
                }
                let _ = stdin.shutdown().await;
            });
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, output_tx));
        }

        let token = cancel.clone();
        let task_id = request.task_id;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => Ok(status.code()),
                    Err(e) => Err(ExecutionError::Spawn(e.to_string())),
                },
                _ = token.cancelled() => {
                    clog_debug!("Cancellation requested for {}; killing agent", task_id);
                    if let Err(e) = child.kill().await {
                        clog_warn!("Failed to kill agent for {}: {}", task_id, e);
                    }
                    Err(ExecutionError::Cancelled)
                }
            };
            let _ = exit_tx.send(status);
        });

        Ok(ExecutionHandle::new(output_rx, exit_rx, cancel))
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                let chunk = OutputChunk {
                    stream,
                    text,
                    at: Utc::now(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                clog_warn!("Agent output stream error: {}", e);
                break;
            }
        }
    }
}
