//! Run controller: owns one run and drives its task graph to an end.
//!
//! The controller is the only writer of the graph. Attempts and advisor
//! calls run as spawned tokio tasks and report back over a channel; the
//! operator talks to a running controller through a [`RunHandle`].
//!
//! ```text
//! dispatch -> attempt worktree -> attempt task (driver + monitor + verifier)
//!                                                              |
//!    completed + integrated  <-- passed --+-- failed -->  ladder
//! ```
//!
//! Every attempt works in its own worktree branched from the run branch
//! tip. Only the controller writes the run branch: verified output is
//! committed in the attempt worktree and replayed onto the run branch.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config::Config;
use crate::core::builder::GraphBuilder;
use crate::core::dag::TaskGraph;
use crate::core::event::{AttemptLog, EventKind, Rung};
use crate::core::task::{BlockReason, Task, TaskDefinition, TaskId, TaskStatus};
use crate::error::ExecutionError;
use crate::git::{AttemptWorktree, GitOps};
use crate::orchestration::advisor::{CommandAdvisor, EscalatingAdvisor, RecoveryAdvisor, RecoveryDecision};
use crate::orchestration::context::TaskContext;
use crate::orchestration::driver::{CommandDriver, ExecutionDriver, ExecutionRequest};
use crate::orchestration::failure::{BlockedSummary, FailureCause, FailureHandler, LadderPolicy};
use crate::orchestration::monitor::{Monitor, MonitorConfig};
use crate::orchestration::scheduler::{priority_for, Dispatch, Scheduler};
use crate::orchestration::verifier::{Verdict, Verifier};
use crate::session::{RunHistory, RunReport, RunSession, RunStatus, RunStore};
use crate::util::blocking_with_timeout;
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};

/// How long in-flight attempts get to wind down after an abandon.
const ABORT_GRACE: Duration = Duration::from_secs(10);
const COMMAND_CHANNEL_SIZE: usize = 32;
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress notifications for the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// An attempt was handed to the driver.
    TaskStarted {
        /// The task being attempted.
        task_id: TaskId,
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// Verification passed and the task's output was committed.
    TaskCompleted {
        task_id: TaskId,
        /// Commit on the run branch, if anything changed.
        commit: Option<String>,
    },
    /// An attempt failed; the ladder decides what happens next.
    TaskFailed {
        task_id: TaskId,
        attempt: u32,
        /// Human-readable failure cause.
        cause: String,
    },
    /// The failure handler moved a task onto a ladder rung.
    Escalated {
        task_id: TaskId,
        rung: Rung,
        detail: String,
    },
    /// A failed task was replaced by smaller tasks.
    TaskDecomposed {
        task_id: TaskId,
        children: Vec<TaskId>,
    },
    TaskBlocked { task_id: TaskId, reason: BlockReason },
    /// A blocked task went back to `pending`.
    TaskReleased { task_id: TaskId },
    StatusChanged { status: RunStatus },
}

/// What a human decides for a task blocked at the top of the ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum HumanDecision {
    /// Try again with a fresh ladder, optionally with guidance.
    Retry { notes: Option<String> },
    /// Swap in a revised definition (same id) and try again.
    Replace { definition: TaskDefinition },
    /// Give up on the run. The branch is kept.
    Abandon,
}

impl HumanDecision {
    pub fn label(&self) -> &'static str {
        match self {
            HumanDecision::Retry { .. } => "retry",
            HumanDecision::Replace { .. } => "replace",
            HumanDecision::Abandon => "abandon",
        }
    }
}

enum AttemptOutcome {
    Passed,
    Failed(FailureCause),
}

struct AttemptReport {
    task_id: TaskId,
    attempt: u32,
    log: AttemptLog,
    outcome: AttemptOutcome,
}

enum Report {
    /// The agent exited cleanly; checks are about to run.
    Verifying { task_id: TaskId },
    Finished(AttemptReport),
    Advice {
        task_id: TaskId,
        rung: Rung,
        result: Result<RecoveryDecision>,
    },
}

enum RunCommand {
    Pause(oneshot::Sender<Result<()>>),
    Resume(oneshot::Sender<Result<()>>),
    CancelTask(TaskId, oneshot::Sender<Result<bool>>),
    Resolve(TaskId, HumanDecision, oneshot::Sender<Result<()>>),
    Abandon(oneshot::Sender<Result<()>>),
    Blocked(oneshot::Sender<Vec<BlockedSummary>>),
    Report(oneshot::Sender<RunReport>),
}

/// Operator-side handle to a running controller. Cheap to clone.
///
/// Once every handle is dropped, a paused run returns from
/// [`RunController::run`] instead of waiting for a decision.
#[derive(Clone)]
pub struct RunHandle {
    commands: mpsc::Sender<RunCommand>,
}

impl RunHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> RunCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Error::RunInactive("finished".to_string()))?;
        rx.await
            .map_err(|_| Error::RunInactive("finished".to_string()))
    }

    /// Stop dispatching new attempts. Attempts in flight finish normally.
    pub async fn pause(&self) -> Result<()> {
        self.request(RunCommand::Pause).await?
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(RunCommand::Resume).await?
    }

    /// Cancel a task. Returns `false` when there was nothing to cancel
    /// (already completed, blocked or cancelled).
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<bool> {
        let task_id = task_id.clone();
        self.request(|tx| RunCommand::CancelTask(task_id, tx)).await?
    }

    pub async fn resolve(&self, task_id: &TaskId, decision: HumanDecision) -> Result<()> {
        let task_id = task_id.clone();
        self.request(|tx| RunCommand::Resolve(task_id, decision, tx)).await?
    }

    /// Abort the run, cancelling whatever is in flight. The branch is kept.
    pub async fn abandon(&self) -> Result<()> {
        self.request(RunCommand::Abandon).await?
    }

    /// Tasks waiting on a human.
    pub async fn blocked(&self) -> Result<Vec<BlockedSummary>> {
        self.request(RunCommand::Blocked).await
    }

    pub async fn report(&self) -> Result<RunReport> {
        self.request(RunCommand::Report).await
    }
}

/// Everything an attempt task needs, cloned into it.
#[derive(Clone)]
struct AttemptRunner {
    driver: Arc<dyn ExecutionDriver>,
    monitor: MonitorConfig,
    verification_timeout: Duration,
}

impl AttemptRunner {
    async fn run(
        self,
        dispatch: Dispatch,
        workspace: std::result::Result<PathBuf, String>,
        mut log: AttemptLog,
        reports: mpsc::UnboundedSender<Report>,
    ) -> AttemptReport {
        let task_id = dispatch.task_id.clone();
        let attempt = dispatch.attempt;
        let outcome = match workspace {
            Ok(workspace) => self.attempt(dispatch, &workspace, &mut log, &reports).await,
            Err(message) => {
                let error = ExecutionError::Spawn(format!("could not prepare workspace: {}", message));
                log.record(EventKind::Error {
                    message: error.to_string(),
                });
                AttemptOutcome::Failed(FailureCause::from(&error))
            }
        };
        AttemptReport {
            task_id,
            attempt,
            log,
            outcome,
        }
    }

    async fn attempt(
        &self,
        dispatch: Dispatch,
        workspace: &Path,
        log: &mut AttemptLog,
        reports: &mpsc::UnboundedSender<Report>,
    ) -> AttemptOutcome {
        let context = TaskContext::new(&dispatch.definition, dispatch.attempt, dispatch.retry_context.clone());
        let request = ExecutionRequest {
            task_id: dispatch.task_id.clone(),
            attempt: dispatch.attempt,
            context,
            workspace: workspace.to_path_buf(),
            isolation: dispatch.isolation,
        };

        let handle = match self.driver.submit(request, dispatch.cancel.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                let error = match e {
                    Error::Execution(error) => error,
                    other => ExecutionError::Spawn(other.to_string()),
                };
                clog_warn!("Driver {} could not start {}: {}", self.driver.name(), dispatch.task_id, error);
                log.record(EventKind::Error {
                    message: error.to_string(),
                });
                return AttemptOutcome::Failed(FailureCause::from(&error));
            }
        };

        let monitor = Monitor::new(workspace, self.monitor.clone());
        let observed = monitor.observe(handle, log).await;
        match observed.exit {
            Ok(Some(0)) => {}
            Ok(code) => {
                let error = ExecutionError::Crash { code };
                log.record(EventKind::Error {
                    message: error.to_string(),
                });
                return AttemptOutcome::Failed(FailureCause::from(&error));
            }
            Err(error) => return AttemptOutcome::Failed(FailureCause::from(&error)),
        }
        if dispatch.cancel.is_cancelled() {
            return AttemptOutcome::Failed(FailureCause::from(&ExecutionError::Cancelled));
        }

        log.record(EventKind::Transition {
            from: TaskStatus::InProgress,
            to: TaskStatus::Verifying,
        });
        let _ = reports.send(Report::Verifying {
            task_id: dispatch.task_id.clone(),
        });

        let verifier = Verifier::new(workspace, self.verification_timeout);
        match verifier.verify(&dispatch.definition.verification, log).await {
            Verdict::Passed => AttemptOutcome::Passed,
            Verdict::Failed { failed_check, output } => {
                AttemptOutcome::Failed(FailureCause::Verification { failed_check, output })
            }
        }
    }
}

/// Drives one run of a task graph.
pub struct RunController {
    session: RunSession,
    graph: Arc<RwLock<TaskGraph>>,
    scheduler: Scheduler,
    runner: AttemptRunner,
    advisor: Arc<dyn RecoveryAdvisor>,
    failures: FailureHandler,
    history: RunHistory,
    store: Option<RunStore>,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports_rx: Option<mpsc::UnboundedReceiver<Report>>,
    commands_rx: Option<mpsc::Receiver<RunCommand>>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
    /// Failed tasks waiting on an advisor answer.
    advising: HashSet<TaskId>,
    /// Tasks the operator cancelled while an attempt or advisor was out.
    cancelled: HashSet<TaskId>,
    /// Worktree of each task's latest attempt. A failed attempt's worktree
    /// stays until the task runs again, for the advisor and the operator.
    worktrees: HashMap<TaskId, AttemptWorktree>,
    /// Paused by the operator rather than by a stall.
    held: bool,
}

impl RunController {
    pub fn new(
        session: RunSession,
        graph: TaskGraph,
        driver: Arc<dyn ExecutionDriver>,
        advisor: Arc<dyn RecoveryAdvisor>,
    ) -> (Self, RunHandle) {
        let config = &session.config;
        let graph = Arc::new(RwLock::new(graph));
        let scheduler =
            Scheduler::new(Arc::clone(&graph), config.concurrency).with_priority(priority_for(config.priority));
        let runner = AttemptRunner {
            driver,
            monitor: MonitorConfig {
                timeout: config.task_timeout(),
                commit_poll: config.commit_poll_interval(),
                watch_files: true,
            },
            verification_timeout: config.verification_timeout(),
        };
        let failures = FailureHandler::new(LadderPolicy::from_config(config));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let controller = Self {
            session,
            graph,
            scheduler,
            runner,
            advisor,
            failures,
            history: RunHistory::new(),
            store: None,
            reports_tx,
            reports_rx: Some(reports_rx),
            commands_rx: Some(commands_rx),
            events: None,
            advising: HashSet::new(),
            cancelled: HashSet::new(),
            worktrees: HashMap::new(),
            held: false,
        };
        (controller, RunHandle { commands: commands_tx })
    }

    /// Compile `definitions`, then create the run branch and worktree.
    /// Starts file logging if nothing else has.
    ///
    /// A build error is returned before anything touches the repository.
    /// Agents and the advisor are the configured commands.
    pub async fn prepare(
        repo: &Path,
        definitions: Vec<TaskDefinition>,
        config: Config,
        worktree_root: Option<&Path>,
    ) -> Result<(Self, RunHandle)> {
        crate::log::init();
        let graph = GraphBuilder::new(config.isolation).build(definitions)?;
        let driver = CommandDriver::from_config(&config);
        for mode in graph.tasks().iter().map(|t| t.isolation_mode).collect::<HashSet<_>>() {
            driver.check_available(mode)?;
        }
        let advisor: Arc<dyn RecoveryAdvisor> = if config.decompose || config.peer_review {
            Arc::new(CommandAdvisor::new(config.effective_reviewer_command()))
        } else {
            Arc::new(EscalatingAdvisor)
        };
        let session = RunSession::create(repo, config, worktree_root).await?;
        let store = RunStore::for_repo(&session.repo_path);
        let (controller, handle) = Self::new(session, graph, Arc::new(driver), advisor);
        Ok((controller.with_store(store), handle))
    }

    /// Persist the report after every finished attempt and status change.
    pub fn with_store(mut self, store: RunStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_file_watch(mut self, enabled: bool) -> Self {
        self.runner.monitor.watch_files = enabled;
        self
    }

    /// Receive [`RunEvent`]s. A later call replaces the earlier receiver.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn session(&self) -> &RunSession {
        &self.session
    }

    pub fn graph(&self) -> Arc<RwLock<TaskGraph>> {
        Arc::clone(&self.graph)
    }

    /// Run until the graph completes, the run is abandoned, or the run is
    /// paused with no operator handle left to decide.
    pub async fn run(mut self) -> Result<RunReport> {
        let (Some(mut reports), Some(mut commands)) = (self.reports_rx.take(), self.commands_rx.take()) else {
            return Err(Error::RunInactive("already started".to_string()));
        };
        self.session.ensure_active()?;
        clog!(
            "Run {} executing on {} (concurrency {}, priority {})",
            self.session.id.short(),
            self.session.branch,
            self.scheduler.pool().max_concurrent(),
            self.scheduler.priority_name()
        );

        let mut commands_open = true;
        self.advance().await;

        while self.session.is_active() {
            if !commands_open && !self.has_work_in_flight() {
                clog!("Run {} paused with no operator attached", self.session.id.short());
                break;
            }
            tokio::select! {
                report = reports.recv() => {
                    if let Some(report) = report {
                        self.on_report(report).await;
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command, &mut reports).await,
                    None => commands_open = false,
                },
            }
            self.advance().await;
        }

        if self.session.status == RunStatus::Completed {
            let tasks: Vec<TaskId> = self.worktrees.keys().cloned().collect();
            for task_id in tasks {
                self.discard_worktree(&task_id).await;
            }
        }
        let report = self.report().await;
        self.persist(&report).await;
        clog!("Run {} finished: {}", self.session.id.short(), self.session.status);
        Ok(report)
    }

    fn has_work_in_flight(&self) -> bool {
        self.scheduler.active_count() > 0 || !self.advising.is_empty()
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // ========== Scheduling ==========

    /// Settle the run status, dispatch what can run, then settle again.
    ///
    /// Settling first lets a run paused on blocked tasks pick up work a
    /// human decision just released.
    async fn advance(&mut self) {
        self.settle_status().await;
        if self.session.status == RunStatus::Running && !self.held {
            match self.scheduler.dispatch().await {
                Ok(dispatched) => {
                    for dispatch in dispatched {
                        let workspace = self.prepare_worktree(&dispatch).await;
                        self.start_attempt(dispatch, workspace);
                    }
                }
                Err(e) => clog_error!("Dispatch failed: {}", e),
            }
        }
        self.settle_status().await;
    }

    /// Check out a fresh worktree for an attempt from the run branch tip,
    /// replacing the task's previous one.
    async fn prepare_worktree(&mut self, dispatch: &Dispatch) -> std::result::Result<PathBuf, String> {
        self.discard_worktree(&dispatch.task_id).await;
        let repo = self.session.repo_path.clone();
        let run_branch = self.session.branch.clone();
        let branch = self.session.attempt_branch(&dispatch.task_id, dispatch.attempt);
        let path = self.session.attempt_workspace(&dispatch.task_id, dispatch.attempt);
        let created = blocking_with_timeout(GIT_TIMEOUT, move || {
            GitOps::new(&repo)?.create_attempt_worktree(&run_branch, &branch, &path)
        })
        .await;
        match created {
            Ok(worktree) => {
                let path = worktree.path.clone();
                self.worktrees.insert(dispatch.task_id.clone(), worktree);
                Ok(path)
            }
            Err(e) => {
                clog_error!("No worktree for attempt {} of {}: {}", dispatch.attempt, dispatch.task_id, e);
                Err(e.to_string())
            }
        }
    }

    async fn discard_worktree(&mut self, task_id: &TaskId) {
        let Some(worktree) = self.worktrees.remove(task_id) else {
            return;
        };
        let repo = self.session.repo_path.clone();
        let removed = blocking_with_timeout(GIT_TIMEOUT, move || {
            GitOps::new(&repo)?.remove_attempt_worktree(&worktree.branch, &worktree.path)
        })
        .await;
        if let Err(e) = removed {
            clog_warn!("Could not remove worktree of {}: {}", task_id, e);
        }
    }

    fn start_attempt(&mut self, dispatch: Dispatch, workspace: std::result::Result<PathBuf, String>) {
        let mut log = AttemptLog::new(dispatch.task_id.clone(), dispatch.attempt);
        log.record(EventKind::Transition {
            from: TaskStatus::Pending,
            to: TaskStatus::Ready,
        });
        log.record(EventKind::Transition {
            from: TaskStatus::Ready,
            to: TaskStatus::InProgress,
        });
        self.emit(RunEvent::TaskStarted {
            task_id: dispatch.task_id.clone(),
            attempt: dispatch.attempt,
        });

        let runner = self.runner.clone();
        let reports = self.reports_tx.clone();
        let task_id = dispatch.task_id.clone();
        let attempt = dispatch.attempt;
        tokio::spawn(async move {
            let inner = tokio::spawn(runner.run(dispatch, workspace, log, reports.clone()));
            let report = match inner.await {
                Ok(report) => report,
                Err(e) => {
                    clog_error!("Attempt {} of {} crashed: {}", attempt, task_id, e);
                    let mut log = AttemptLog::new(task_id.clone(), attempt);
                    let error = ExecutionError::Spawn(format!("attempt task crashed: {}", e));
                    log.record(EventKind::Error {
                        message: error.to_string(),
                    });
                    AttemptReport {
                        task_id,
                        attempt,
                        log,
                        outcome: AttemptOutcome::Failed(FailureCause::from(&error)),
                    }
                }
            };
            let _ = reports.send(Report::Finished(report));
        });
    }

    async fn settle_status(&mut self) {
        if !self.session.is_active() {
            return;
        }
        let graph = self.graph.read().await;
        let next = if graph.all_settled() {
            RunStatus::Completed
        } else if self.held {
            RunStatus::Paused
        } else if !self.has_work_in_flight() && graph.eligible().is_empty() {
            // Whatever is left is blocked and waits on a human.
            RunStatus::Paused
        } else {
            RunStatus::Running
        };
        drop(graph);
        self.set_status(next).await;
    }

    async fn set_status(&mut self, status: RunStatus) {
        if self.session.status == status {
            return;
        }
        match status {
            RunStatus::Paused if !self.held => {
                clog_warn!("Run {} paused: blocked tasks need a decision", self.session.id.short())
            }
            _ => clog!("Run {} is now {}", self.session.id.short(), status),
        }
        self.session.set_status(status);
        self.emit(RunEvent::StatusChanged { status });
        let report = self.report().await;
        self.persist(&report).await;
    }

    // ========== Reports from attempts and advisors ==========

    async fn on_report(&mut self, report: Report) {
        let result = match report {
            Report::Verifying { task_id } => self.on_verifying(&task_id).await,
            Report::Finished(report) => self.on_finished(report).await,
            Report::Advice { task_id, rung, result } => self.on_advice(task_id, rung, result).await,
        };
        if let Err(e) = result {
            clog_error!("Run {}: {}", self.session.id.short(), e);
        }
    }

    async fn on_verifying(&mut self, task_id: &TaskId) -> Result<()> {
        let mut graph = self.graph.write().await;
        let task = graph.task_mut(task_id)?;
        if task.status == TaskStatus::InProgress {
            task.begin_verifying()?;
        }
        Ok(())
    }

    async fn on_finished(&mut self, report: AttemptReport) -> Result<()> {
        let AttemptReport {
            task_id,
            attempt,
            log,
            outcome,
        } = report;
        self.scheduler.release(&task_id);
        self.history.push(log);

        if self.cancelled.remove(&task_id) {
            self.block(&task_id, BlockReason::Cancelled).await?;
        } else {
            match outcome {
                AttemptOutcome::Passed => self.complete(&task_id, attempt).await?,
                AttemptOutcome::Failed(cause) => self.fail_attempt(&task_id, attempt, cause).await?,
            }
        }

        let report = self.report().await;
        self.persist(&report).await;
        Ok(())
    }

    async fn fail_attempt(&mut self, task_id: &TaskId, attempt: u32, cause: FailureCause) -> Result<()> {
        clog_warn!("Attempt {} of {} failed: {}", attempt, task_id, cause);
        self.emit(RunEvent::TaskFailed {
            task_id: task_id.clone(),
            attempt,
            cause: cause.to_string(),
        });
        self.change(task_id, Task::fail).await?;
        self.failures.record_failure(task_id, cause);
        self.climb(task_id).await
    }

    /// Commit the verified output in the attempt worktree, replay it onto
    /// the run branch, then mark the task completed.
    ///
    /// Output that cannot be integrated fails the attempt.
    async fn complete(&mut self, task_id: &TaskId, attempt: u32) -> Result<()> {
        let (files, message) = {
            let graph = self.graph.read().await;
            let task = graph.get(task_id).ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
            (
                task.definition.output_files.clone(),
                format!("{}: {}", task_id, task.definition.title),
            )
        };
        let Some(worktree) = self.worktrees.get(task_id).cloned() else {
            let message = format!("no worktree for attempt {}", attempt);
            return self.fail_attempt(task_id, attempt, FailureCause::Integration { message }).await;
        };
        let run_workspace = self.session.workspace.clone();
        let integrated = blocking_with_timeout(GIT_TIMEOUT, move || {
            if files.is_empty() {
                GitOps::commit_all(&worktree.path, &message)?;
            } else {
                GitOps::commit_paths(&worktree.path, &files, &message)?;
            }
            let head = GitOps::head_commit(&worktree.path)?;
            GitOps::integrate(&run_workspace, &worktree.base, &head, &message)
        })
        .await;

        let commit = match integrated {
            Ok(commit) => commit,
            Err(e) => {
                let message = e.to_string();
                self.history.record(
                    task_id,
                    EventKind::Error {
                        message: format!("integration failed: {}", message),
                    },
                );
                return self.fail_attempt(task_id, attempt, FailureCause::Integration { message }).await;
            }
        };

        self.change(task_id, Task::complete).await?;
        match &commit {
            Some(hash) => {
                self.history.record(task_id, EventKind::Commit { hash: hash.clone() });
                self.graph.write().await.task_mut(task_id)?.set_commit(hash);
            }
            None => clog_debug!("{} completed without changes to commit", task_id),
        }
        self.discard_worktree(task_id).await;
        clog!("Task {} completed", task_id);
        self.emit(RunEvent::TaskCompleted {
            task_id: task_id.clone(),
            commit,
        });
        Ok(())
    }

    // ========== Escalation ladder ==========

    /// Take the next rung for a failed task.
    async fn climb(&mut self, task_id: &TaskId) -> Result<()> {
        let task = self
            .graph
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;

        let rung = self.failures.next_rung(&task);
        let detail = match rung {
            Rung::Retry => format!(
                "retry {} of {}",
                self.failures.ladder(task_id).map(|l| l.retries_used).unwrap_or(0),
                self.failures.policy().max_retries
            ),
            Rung::Decompose => "asking advisor for a decomposition".to_string(),
            Rung::PeerReview => "asking advisor for a review".to_string(),
            Rung::Human => format!("needs a human after {} attempt(s)", task.attempt_count),
        };
        self.note_rung(task_id, task.attempt_count, rung, detail);

        match rung {
            Rung::Retry => {
                let notes = self.retry_notes(task_id);
                self.change(task_id, |t| {
                    t.retry_context = notes;
                    t.reset_to_pending()
                })
                .await
            }
            Rung::Decompose | Rung::PeerReview => {
                self.ask_advisor(&task, rung);
                Ok(())
            }
            Rung::Human => self.escalate_to_human(task_id).await,
        }
    }

    fn note_rung(&mut self, task_id: &TaskId, attempt: u32, rung: Rung, detail: String) {
        clog_debug!("{} -> {} ({})", task_id, rung, detail);
        self.failures.note_step(task_id, attempt, rung, detail.clone());
        self.history.record(
            task_id,
            EventKind::Escalation {
                rung,
                detail: detail.clone(),
            },
        );
        self.emit(RunEvent::Escalated {
            task_id: task_id.clone(),
            rung,
            detail,
        });
    }

    fn retry_notes(&self, task_id: &TaskId) -> Option<String> {
        let cause = self.failures.ladder(task_id)?.last_failure.as_ref()?;
        let log = self.history.latest(task_id)?;
        Some(FailureHandler::retry_notes(cause, log))
    }

    fn ask_advisor(&mut self, task: &Task, rung: Rung) {
        let empty = AttemptLog::new(task.id().clone(), task.attempt_count);
        let log = self.history.latest(task.id()).unwrap_or(&empty);
        let workspace = self
            .worktrees
            .get(task.id())
            .map(|w| w.path.as_path())
            .unwrap_or(self.session.workspace.as_path());
        let report = self.failures.failure_report(task, log, workspace);
        let advisor = Arc::clone(&self.advisor);
        let reports = self.reports_tx.clone();
        let task_id = task.id().clone();
        self.advising.insert(task_id.clone());

        tokio::spawn(async move {
            let call = match rung {
                Rung::Decompose => advisor.propose_decomposition(report),
                _ => advisor.review_failure(report),
            };
            let result = match tokio::spawn(call).await {
                Ok(result) => result,
                Err(e) => Err(Error::TaskJoin(e.to_string())),
            };
            let _ = reports.send(Report::Advice { task_id, rung, result });
        });
    }

    async fn on_advice(&mut self, task_id: TaskId, rung: Rung, result: Result<RecoveryDecision>) -> Result<()> {
        self.advising.remove(&task_id);
        if self.cancelled.remove(&task_id) || !self.session.is_active() {
            return self.block(&task_id, BlockReason::Cancelled).await;
        }

        match (rung, result) {
            (Rung::Decompose, Ok(RecoveryDecision::Decompose { children })) => {
                let decomposed = self.graph.write().await.decompose(&task_id, children);
                match decomposed {
                    Ok(children) => {
                        clog!("Task {} decomposed into {:?}", task_id, children);
                        self.history.record(
                            &task_id,
                            EventKind::Transition {
                                from: TaskStatus::Failed,
                                to: TaskStatus::Decomposed,
                            },
                        );
                        self.emit(RunEvent::TaskDecomposed {
                            task_id: task_id.clone(),
                            children,
                        });
                        Ok(())
                    }
                    Err(e) => self.unusable_advice(&task_id, rung, e.to_string()).await,
                }
            }
            (Rung::Decompose, Ok(other)) => {
                let detail = format!("advisor answered {} instead of a decomposition", other.label());
                self.unusable_advice(&task_id, rung, detail).await
            }
            (Rung::PeerReview, Ok(RecoveryDecision::Retry(context))) => {
                self.failures.set_review_notes(&task_id, &context.notes);
                if let Some(mut revised) = context.revised {
                    revised.id = task_id.clone();
                    if let Err(e) = self.graph.write().await.replace_definition(revised) {
                        clog_warn!("Ignoring revised definition for {}: {}", task_id, e);
                    }
                }
                let notes = context.notes;
                self.change(&task_id, move |t| {
                    t.retry_context = Some(notes);
                    t.reset_to_pending()
                })
                .await
            }
            (_, Ok(RecoveryDecision::Escalate { reason })) => {
                self.failures.set_review_notes(&task_id, &reason);
                self.escalate_to_human(&task_id).await
            }
            (_, Ok(other)) => {
                self.failures
                    .set_review_notes(&task_id, &format!("reviewer answered {}", other.label()));
                self.escalate_to_human(&task_id).await
            }
            (rung, Err(e)) => {
                clog_warn!("Advisor failed on {} for {}: {}", rung, task_id, e);
                match rung {
                    Rung::Decompose => self.unusable_advice(&task_id, rung, e.to_string()).await,
                    _ => {
                        self.failures
                            .set_review_notes(&task_id, &format!("review failed: {}", e));
                        self.escalate_to_human(&task_id).await
                    }
                }
            }
        }
    }

    /// Record why an advisor answer was not applied and move up the ladder.
    async fn unusable_advice(&mut self, task_id: &TaskId, rung: Rung, detail: String) -> Result<()> {
        clog_warn!("Unusable {} advice for {}: {}", rung, task_id, detail);
        self.history.record(
            task_id,
            EventKind::Error {
                message: format!("{} advice unusable: {}", rung, detail),
            },
        );
        self.climb(task_id).await
    }

    async fn escalate_to_human(&mut self, task_id: &TaskId) -> Result<()> {
        let summary = {
            let graph = self.graph.read().await;
            let task = graph.get(task_id).ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
            self.failures
                .blocked_summary(task)
                .last_failure
                .unwrap_or_else(|| "escalation ladder exhausted".to_string())
        };
        self.block(task_id, BlockReason::Escalated { summary }).await
    }

    /// Block a task and every pending dependent.
    async fn block(&mut self, task_id: &TaskId, reason: BlockReason) -> Result<()> {
        let from = self
            .graph
            .read()
            .await
            .status_of(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        let dependents = self.scheduler.block_with_dependents(task_id, reason.clone()).await?;
        clog_warn!("Task {} blocked: {}", task_id, reason);

        self.history.record(
            task_id,
            EventKind::Transition {
                from,
                to: TaskStatus::Blocked,
            },
        );
        self.emit(RunEvent::TaskBlocked {
            task_id: task_id.clone(),
            reason,
        });
        for dependent in dependents {
            self.history.record(
                &dependent,
                EventKind::Transition {
                    from: TaskStatus::Pending,
                    to: TaskStatus::Blocked,
                },
            );
            self.emit(RunEvent::TaskBlocked {
                task_id: dependent,
                reason: BlockReason::Upstream {
                    task: task_id.clone(),
                },
            });
        }
        Ok(())
    }

    /// Apply a status change to one task and record the transition.
    async fn change<F>(&mut self, task_id: &TaskId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let (from, to) = {
            let mut graph = self.graph.write().await;
            let task = graph.task_mut(task_id)?;
            let from = task.status;
            apply(task)?;
            (from, task.status)
        };
        if from != to {
            self.history.record(task_id, EventKind::Transition { from, to });
        }
        Ok(())
    }

    // ========== Operator commands ==========

    async fn on_command(&mut self, command: RunCommand, reports: &mut mpsc::UnboundedReceiver<Report>) {
        match command {
            RunCommand::Pause(reply) => {
                let _ = reply.send(self.pause().await);
            }
            RunCommand::Resume(reply) => {
                let _ = reply.send(self.resume().await);
            }
            RunCommand::CancelTask(task_id, reply) => {
                let _ = reply.send(self.cancel_task(&task_id).await);
            }
            RunCommand::Resolve(task_id, decision, reply) => {
                let result = match decision {
                    HumanDecision::Abandon => self.abandon(reports).await,
                    decision => self.resolve(&task_id, decision).await,
                };
                let _ = reply.send(result);
            }
            RunCommand::Abandon(reply) => {
                let _ = reply.send(self.abandon(reports).await);
            }
            RunCommand::Blocked(reply) => {
                let _ = reply.send(self.blocked().await);
            }
            RunCommand::Report(reply) => {
                let _ = reply.send(self.report().await);
            }
        }
    }

    async fn pause(&mut self) -> Result<()> {
        self.session.ensure_active()?;
        self.held = true;
        self.set_status(RunStatus::Paused).await;
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        self.session.ensure_active()?;
        self.held = false;
        self.set_status(RunStatus::Running).await;
        Ok(())
    }

    async fn cancel_task(&mut self, task_id: &TaskId) -> Result<bool> {
        self.session.ensure_active()?;
        let status = self
            .graph
            .read()
            .await
            .status_of(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;

        if self.cancelled.contains(task_id) {
            return Ok(false);
        }
        match status {
            TaskStatus::InProgress | TaskStatus::Verifying | TaskStatus::Ready => {
                clog!("Cancelling attempt of {}", task_id);
                self.cancelled.insert(task_id.clone());
                self.scheduler.cancel(task_id);
                Ok(true)
            }
            TaskStatus::Failed if self.advising.contains(task_id) => {
                self.cancelled.insert(task_id.clone());
                Ok(true)
            }
            TaskStatus::Pending => {
                self.block(task_id, BlockReason::Cancelled).await?;
                Ok(true)
            }
            _ => {
                clog_debug!("Nothing to cancel for {} ({})", task_id, status);
                Ok(false)
            }
        }
    }

    async fn resolve(&mut self, task_id: &TaskId, decision: HumanDecision) -> Result<()> {
        self.session.ensure_active()?;
        let task = self
            .graph
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        if !task.is_blocked_at_source() {
            return Err(Error::Validation(format!(
                "{} is {} and has no decision pending",
                task_id,
                match &task.block_reason {
                    Some(reason) => reason.to_string(),
                    None => task.status.to_string(),
                }
            )));
        }

        let detail = format!("human decision: {}", decision.label());
        match decision {
            HumanDecision::Retry { notes } => {
                let notes = notes.or_else(|| self.retry_notes(task_id));
                self.failures.reset(&task);
                self.change(task_id, move |t| {
                    t.retry_context = notes;
                    t.reset_to_pending()
                })
                .await?;
            }
            HumanDecision::Replace { mut definition } => {
                definition.id = task_id.clone();
                self.graph.write().await.replace_definition(definition)?;
                self.failures.reset(&task);
                self.change(task_id, |t| {
                    t.retry_context = None;
                    t.reset_to_pending()
                })
                .await?;
            }
            HumanDecision::Abandon => {
                return Err(Error::Validation("abandon is handled by the run".to_string()))
            }
        }
        self.note_rung(task_id, task.attempt_count, Rung::Human, detail);

        let released = self.graph.write().await.release_upstream_blocks()?;
        for id in released {
            self.history.record(
                &id,
                EventKind::Transition {
                    from: TaskStatus::Blocked,
                    to: TaskStatus::Pending,
                },
            );
            self.emit(RunEvent::TaskReleased { task_id: id });
        }
        self.emit(RunEvent::TaskReleased {
            task_id: task_id.clone(),
        });
        Ok(())
    }

    /// Abort the run. In-flight attempts are cancelled and given a short
    /// grace period to report; nothing is rolled back.
    async fn abandon(&mut self, reports: &mut mpsc::UnboundedReceiver<Report>) -> Result<()> {
        self.session.ensure_active()?;
        clog!("Abandoning run {}; branch {} is kept", self.session.id.short(), self.session.branch);
        self.scheduler.cancel_all();
        for id in self.scheduler.pool().active_ids() {
            self.cancelled.insert(id);
        }
        for id in self.advising.clone() {
            self.cancelled.insert(id);
        }
        self.set_status(RunStatus::Aborted).await;

        let deadline = tokio::time::Instant::now() + ABORT_GRACE;
        while self.has_work_in_flight() {
            match tokio::time::timeout_at(deadline, reports.recv()).await {
                Ok(Some(report)) => self.on_report(report).await,
                Ok(None) => break,
                Err(_) => {
                    clog_warn!(
                        "{} attempt(s) did not stop within {:?}",
                        self.scheduler.active_count(),
                        ABORT_GRACE
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    async fn blocked(&self) -> Vec<BlockedSummary> {
        let graph = self.graph.read().await;
        let mut tasks: Vec<_> = graph.tasks().into_iter().filter(|t| t.is_blocked_at_source()).collect();
        tasks.sort_by_key(|t| t.order);
        tasks
            .into_iter()
            .map(|t| self.failures.blocked_summary(t))
            .collect()
    }

    async fn report(&self) -> RunReport {
        let blocked = self.blocked().await;
        let graph = self.graph.read().await;
        RunReport::build(&self.session, &graph, &self.history, blocked)
    }

    async fn persist(&self, report: &RunReport) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(report).await {
                clog_warn!("Could not save run report: {}", e);
            }
        }
    }
}
