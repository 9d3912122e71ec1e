//! Run sessions: the explicit value describing one execution run, its
//! per-task event history and the report persisted for review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::Config;
use crate::core::dag::TaskGraph;
use crate::core::event::{AttemptLog, EventKind, ExecutionEvent};
use crate::core::task::{BlockReason, IsolationMode, TaskId, TaskStatus};
use crate::git::GitOps;
use crate::orchestration::failure::BlockedSummary;
use crate::util::blocking;
use crate::{clog, clog_debug, Error, Result};

const REPORT_VERSION: u32 = 1;
const REPORT_FILE: &str = "report.json";
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    /// Nothing can move until a human decides on a blocked task.
    Paused,
    Completed,
    /// Abandoned by the operator. The branch is kept.
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// One execution run of a task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSession {
    pub id: RunId,
    pub config: Config,
    pub repo_path: PathBuf,
    /// Run branch, e.g. `conductor/1a2b3c4d`.
    pub branch: String,
    /// Worktree checked out on the run branch. It only ever holds
    /// integrated output; agents work in per-attempt worktrees beside it.
    pub workspace: PathBuf,
    pub base_commit: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSession {
    /// Create the run branch from HEAD and check it out in a fresh worktree
    /// under `worktree_root` (default `~/.conductor/worktrees`).
    pub async fn create(repo: &Path, config: Config, worktree_root: Option<&Path>) -> Result<Self> {
        config.validate()?;
        let id = RunId::new();
        let git = GitOps::new(repo)?;
        let repo_path = git.repo_path().to_path_buf();
        let branch = format!("{}/{}", config.branch_prefix, id.short());
        let root = match worktree_root {
            Some(root) => root.to_path_buf(),
            None => Config::conductor_dir()?.join("worktrees"),
        };
        let workspace = root.join(format!("{}-{}", git.repo_name(), id.short()));
        clog_debug!(
            "RunSession::create id={} branch={} workspace={}",
            id.short(),
            branch,
            workspace.display()
        );

        let base_commit = {
            let branch = branch.clone();
            let workspace = workspace.clone();
            blocking(move || git.create_run_branch(&branch, &workspace)).await?
        };

        let now = Utc::now();
        clog!("Run {} started on branch {}", id.short(), branch);
        Ok(Self {
            id,
            config,
            repo_path,
            branch,
            workspace,
            base_commit,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn set_status(&mut self, status: RunStatus) {
        if self.status != status {
            clog_debug!("Run {} {} -> {}", self.id.short(), self.status, status);
            self.status = status;
            self.updated_at = Utc::now();
        }
    }

    /// Branch of one attempt, named after the run branch.
    pub fn attempt_branch(&self, task_id: &TaskId, attempt: u32) -> String {
        format!("{}-{}-{}", self.branch, name_safe(task_id.as_str()), attempt)
    }

    /// Worktree of one attempt, under `<run worktree>-attempts/`.
    pub fn attempt_workspace(&self, task_id: &TaskId, attempt: u32) -> PathBuf {
        let run_dir = self
            .workspace
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("run");
        self.workspace
            .with_file_name(format!("{}-attempts", run_dir))
            .join(format!("{}-{}-{}", self.id.short(), name_safe(task_id.as_str()), attempt))
    }

    /// Fail unless the run still accepts operations.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::RunInactive(self.status.to_string()))
        }
    }
}

/// Task ids go into branch and directory names.
fn name_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Every attempt log of every task, in attempt order.
///
/// Events that happen outside a running attempt (escalations, human
/// decisions, upstream blocks) are appended to the task's latest attempt,
/// or to an attempt `0` log when the task never ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunHistory {
    logs: BTreeMap<TaskId, Vec<AttemptLog>>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a finished attempt's log.
    pub fn push(&mut self, log: AttemptLog) {
        let logs = self.logs.entry(log.task_id().clone()).or_default();
        match logs.iter().position(|l| l.attempt() == log.attempt()) {
            Some(idx) => {
                // Events recorded before the attempt started come first.
                let mut merged = std::mem::replace(&mut logs[idx], log);
                let events = logs[idx].events().to_vec();
                for event in events {
                    merged.record_at(event.timestamp, event.kind);
                }
                logs[idx] = merged;
            }
            None => {
                logs.push(log);
                logs.sort_by_key(|l| l.attempt());
            }
        }
    }

    /// Append an event to the task's latest attempt.
    pub fn record(&mut self, task_id: &TaskId, kind: EventKind) -> ExecutionEvent {
        let logs = self.logs.entry(task_id.clone()).or_default();
        if logs.is_empty() {
            logs.push(AttemptLog::new(task_id.clone(), 0));
        }
        let last = logs.len() - 1;
        logs[last].record(kind).clone()
    }

    pub fn attempts(&self, task_id: &TaskId) -> &[AttemptLog] {
        self.logs.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn latest(&self, task_id: &TaskId) -> Option<&AttemptLog> {
        self.logs.get(task_id).and_then(|logs| logs.last())
    }

    /// All events of one task, attempt by attempt.
    pub fn events(&self, task_id: &TaskId) -> Vec<&ExecutionEvent> {
        self.attempts(task_id)
            .iter()
            .flat_map(|log| log.events())
            .collect()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.logs.keys()
    }
}

/// Final (or current) state of one task, with its full event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub isolation: IsolationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decomposed_from: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaced_by: Vec<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<BlockReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub attempt_logs: Vec<AttemptLog>,
}

/// What a run hands to review: run state, every task and blocked summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub version: u32,
    pub run_id: RunId,
    pub status: RunStatus,
    pub branch: String,
    pub base_commit: String,
    pub workspace: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub tasks: Vec<TaskReport>,
    pub blocked: Vec<BlockedSummary>,
}

impl RunReport {
    /// Snapshot `graph` and `history`, tasks in compile order.
    pub fn build(
        session: &RunSession,
        graph: &TaskGraph,
        history: &RunHistory,
        blocked: Vec<BlockedSummary>,
    ) -> Self {
        let mut tasks: Vec<_> = graph.tasks();
        tasks.sort_by_key(|t| t.order);
        let tasks = tasks
            .into_iter()
            .map(|task| TaskReport {
                id: task.id().clone(),
                title: task.definition.title.clone(),
                status: task.status,
                attempts: task.attempt_count,
                isolation: task.isolation_mode,
                decomposed_from: task.decomposed_from.clone(),
                replaced_by: task.replaced_by.clone(),
                block_reason: task.block_reason.clone(),
                commit: task.commit_hash.clone(),
                attempt_logs: history.attempts(task.id()).to_vec(),
            })
            .collect();

        Self {
            version: REPORT_VERSION,
            run_id: session.id,
            status: session.status,
            branch: session.branch.clone(),
            base_commit: session.base_commit.clone(),
            workspace: session.workspace.clone(),
            generated_at: Utc::now(),
            tasks,
            blocked,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Every event of the run, task by task in compile order.
    pub fn events(&self) -> impl Iterator<Item = &ExecutionEvent> {
        self.tasks
            .iter()
            .flat_map(|t| t.attempt_logs.iter())
            .flat_map(|log| log.events())
    }
}

/// Writes run reports under `<repo>/.conductor/runs/<run-id>/`.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_repo(repo: &Path) -> Self {
        Self::new(Config::repo_dir(repo).join("runs"))
    }

    pub fn run_dir(&self, id: &RunId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn report_path(&self, id: &RunId) -> PathBuf {
        self.run_dir(id).join(REPORT_FILE)
    }

    pub fn events_path(&self, id: &RunId) -> PathBuf {
        self.run_dir(id).join(EVENTS_FILE)
    }

    pub async fn save(&self, report: &RunReport) -> Result<()> {
        let store = self.clone();
        let report = report.clone();
        blocking(move || store.save_sync(&report)).await
    }

    /// Write `report.json` and `events.jsonl`, each via a temp file and rename.
    pub fn save_sync(&self, report: &RunReport) -> Result<()> {
        let dir = self.run_dir(&report.run_id);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let report_path = self.report_path(&report.run_id);
        let temp_path = report_path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(report)?)?;
        fs::rename(&temp_path, &report_path)?;

        let events_path = self.events_path(&report.run_id);
        let temp_path = events_path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&temp_path)?;
        for event in report.events() {
            serde_json::to_writer(&mut file, event)?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        fs::rename(&temp_path, &events_path)?;

        clog_debug!("Run report saved: {}", report_path.display());
        Ok(())
    }

    pub fn load(&self, id: &RunId) -> Result<RunReport> {
        let contents = fs::read_to_string(self.report_path(id))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Ids of every stored run.
    pub fn list(&self) -> Result<Vec<RunId>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
