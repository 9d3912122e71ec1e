//! Monitor: merges every signal of one attempt into its event log.
//!
//! Sources are agent output, filesystem notifications from the workspace,
//! new commits on the workspace HEAD and the exit status. The monitor only
//! records; judging the attempt is left to the verifier and the failure
//! handler.

use crate::core::event::{AttemptLog, EventKind, FileChange};
use crate::error::ExecutionError;
use crate::git::GitOps;
use crate::orchestration::context::DONE_MARKER;
use crate::orchestration::driver::{ExecutionHandle, ExitStatus, OutputChunk};
use crate::util::blocking;
use crate::{clog_debug, clog_warn};
use notify::{Config as NotifyConfig, Event, EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// How long a stopped agent gets to report its exit before the monitor
/// gives up on it.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// How long to keep reading buffered output after the exit status arrives.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const FILE_CHANNEL_SIZE: usize = 256;

static DONE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)^\s*(?:{}|task complete[.!]?)\s*$",
        regex::escape(DONE_MARKER)
    ))
    .expect("done marker regex is valid")
});

/// Whether an output line is the agent claiming completion.
pub fn is_done_signal(line: &str) -> bool {
    DONE_MARKER_RE.is_match(line)
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub timeout: Duration,
    pub commit_poll: Duration,
    pub watch_files: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            commit_poll: Duration::from_secs(1),
            watch_files: true,
        }
    }
}

/// What the monitor saw at the end of an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorOutcome {
    pub exit: ExitStatus,
    /// The agent printed a done marker.
    pub agent_signalled: bool,
}

pub struct Monitor {
    workspace: PathBuf,
    config: MonitorConfig,
}

type FileSignal = std::result::Result<(PathBuf, FileChange), String>;

impl Monitor {
    pub fn new(workspace: impl Into<PathBuf>, config: MonitorConfig) -> Self {
        Self {
            workspace: workspace.into(),
            config,
        }
    }

    /// Follow an attempt until it ends, recording into `log`.
    ///
    /// Enforces the per-task timeout by cancelling the handle.
    pub async fn observe(&self, handle: ExecutionHandle, log: &mut AttemptLog) -> MonitorOutcome {
        let (mut output, mut exit_rx, cancel) = handle.into_parts();
        let mut agent_signalled = false;

        let (file_tx, file_rx) = mpsc::channel(FILE_CHANNEL_SIZE);
        let _watcher = if self.config.watch_files {
            match start_watcher(&self.workspace, file_tx) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    clog_warn!("File watcher unavailable for {}: {}", self.workspace.display(), e);
                    log.record(EventKind::Error {
                        message: format!("file watcher unavailable: {}", e),
                    });
                    None
                }
            }
        } else {
            None
        };
        let mut file_rx = Some(file_rx);

        let mut last_head = self.head().await.ok();
        let mut last_poll_error: Option<String> = None;
        let mut ticker = tokio::time::interval(self.config.commit_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut stopping: Option<ExecutionError> = None;
        let mut output_open = true;

        let exit = loop {
            tokio::select! {
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => agent_signalled |= record_output(log, chunk),
                    None => output_open = false,
                },
                signal = next_file_signal(&mut file_rx) => match signal {
                    Some(Ok((path, change))) => {
                        log.record(EventKind::FileChanged { path, change });
                    }
                    Some(Err(message)) => {
                        log.record(EventKind::Error { message: format!("file watcher: {}", message) });
                    }
                    None => file_rx = None,
                },
                _ = ticker.tick() => {
                    match self.head().await {
                        Ok(head) => {
                            if last_head.as_deref() != Some(head.as_str()) {
                                if last_head.is_some() {
                                    log.record(EventKind::Commit { hash: head.clone() });
                                }
                                last_head = Some(head);
                            }
                            last_poll_error = None;
                        }
                        Err(message) => {
                            if last_poll_error.as_deref() != Some(message.as_str()) {
                                log.record(EventKind::Error { message: format!("commit poll: {}", message) });
                                last_poll_error = Some(message);
                            }
                        }
                    }
                },
                _ = cancel.cancelled(), if stopping.is_none() => {
                    clog_debug!("Attempt {} of {} cancelled", log.attempt(), log.task_id());
                    stopping = Some(ExecutionError::Cancelled);
                    deadline.as_mut().reset(Instant::now() + STOP_GRACE);
                },
                _ = &mut deadline => match stopping.take() {
                    None => {
                        clog_warn!("Attempt {} of {} timed out", log.attempt(), log.task_id());
                        let timeout = ExecutionError::Timeout(self.config.timeout);
                        log.record(EventKind::Error { message: timeout.to_string() });
                        stopping = Some(timeout);
                        cancel.cancel();
                        deadline.as_mut().reset(Instant::now() + STOP_GRACE);
                    }
                    Some(reason) => {
                        clog_warn!("Agent for {} did not stop within {:?}", log.task_id(), STOP_GRACE);
                        break Err(reason);
                    }
                },
                status = &mut exit_rx => {
                    let status = status.unwrap_or_else(|_| {
                        Err(ExecutionError::Spawn("driver dropped the exit status".to_string()))
                    });
                    break match &stopping {
                        Some(reason) => Err(reason.clone()),
                        None if cancel.is_cancelled() => Err(ExecutionError::Cancelled),
                        None => status,
                    };
                }
            }
        };

        // Output produced just before exit may still be buffered.
        if output_open {
            let drain = async {
                while let Some(chunk) = output.recv().await {
                    agent_signalled |= record_output(log, chunk);
                }
            };
            if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                clog_debug!("Output of {} still open after exit; stopped draining", log.task_id());
            }
        }
        if let Ok(head) = self.head().await {
            if last_head.as_deref().is_some_and(|last| last != head) {
                log.record(EventKind::Commit { hash: head });
            }
        }

        match &exit {
            Ok(code) => {
                log.record(EventKind::Exit { code: *code });
            }
            Err(ExecutionError::Timeout(_)) => {}
            Err(e) => {
                log.record(EventKind::Error { message: e.to_string() });
            }
        }

        MonitorOutcome {
            exit,
            agent_signalled,
        }
    }

    async fn head(&self) -> std::result::Result<String, String> {
        let workspace = self.workspace.clone();
        blocking(move || GitOps::head_commit(&workspace))
            .await
            .map_err(|e| e.to_string())
    }
}

/// Returns whether the line was a done marker.
fn record_output(log: &mut AttemptLog, chunk: OutputChunk) -> bool {
    let done = is_done_signal(&chunk.text);
    let at = chunk.at;
    let text = chunk.text;
    if done {
        log.record_at(
            at,
            EventKind::AgentSignal {
                message: text.trim().to_string(),
            },
        );
    }
    log.record_at(
        at,
        EventKind::Output {
            stream: chunk.stream,
            text,
        },
    );
    done
}

async fn next_file_signal(rx: &mut Option<mpsc::Receiver<FileSignal>>) -> Option<FileSignal> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn start_watcher(workspace: &Path, tx: mpsc::Sender<FileSignal>) -> notify::Result<RecommendedWatcher> {
    let root = workspace.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let change = match event.kind {
                    NotifyKind::Create(_) => FileChange::Created,
                    NotifyKind::Modify(_) => FileChange::Modified,
                    NotifyKind::Remove(_) => FileChange::Removed,
                    _ => return,
                };
                for path in event.paths {
                    let relative = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
                    if relative.components().any(|c| c.as_os_str() == ".git") {
                        continue;
                    }
                    let _ = tx.blocking_send(Ok((relative, change)));
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(e.to_string()));
            }
        },
        NotifyConfig::default(),
    )?;
    watcher.watch(workspace, RecursiveMode::Recursive)?;
    Ok(watcher)
}
