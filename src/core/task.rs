//! Task data model for the execution graph.
//!
//! A `TaskDefinition` is what the planning collaborator hands over; a `Task`
//! is the runtime node the engine schedules, with status and attempt
//! bookkeeping layered on top of the definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Human-referenceable task identifier (e.g. `T-001`).
///
/// Ids come from the plan and stay stable for the whole run; the graph
/// never refers to tasks by position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies (or for a retry to be dispatched).
    #[default]
    Pending,
    /// Claimed by the scheduler, about to be handed to the driver.
    Ready,
    /// An agent process is working on the task.
    InProgress,
    /// The agent exited; verification checks are running.
    Verifying,
    /// Verification passed.
    Completed,
    /// The last attempt failed; the failure handler has not decided yet.
    Failed,
    /// Waiting on a human, directly or through a blocked dependency.
    Blocked,
    /// Replaced by child tasks. Kept for audit.
    Decomposed,
}

impl TaskStatus {
    /// Whether moving from `self` to `to` is a legal lifecycle step.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Blocked)
                | (Ready, InProgress)
                | (Ready, Pending)
                | (Ready, Blocked)
                | (InProgress, Verifying)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (Verifying, Completed)
                | (Verifying, Failed)
                | (Verifying, Blocked)
                | (Failed, Pending)
                | (Failed, Decomposed)
                | (Failed, Blocked)
                | (Blocked, Pending)
        )
    }

    /// Completed, or decomposed into children that carry the work.
    pub fn is_settled(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Decomposed)
    }

    /// Ready, in progress or verifying.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Ready | TaskStatus::InProgress | TaskStatus::Verifying
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Decomposed => "decomposed",
        };
        write!(f, "{}", s)
    }
}

/// Where an agent process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Directly in the run workspace.
    #[default]
    Direct,
    /// Inside a container with the workspace mounted.
    Container,
    /// Inside a sandbox wrapper on the host.
    Sandbox,
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationMode::Direct => write!(f, "direct"),
            IsolationMode::Container => write!(f, "container"),
            IsolationMode::Sandbox => write!(f, "sandbox"),
        }
    }
}

impl std::str::FromStr for IsolationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(IsolationMode::Direct),
            "container" => Ok(IsolationMode::Container),
            "sandbox" => Ok(IsolationMode::Sandbox),
            other => Err(Error::Validation(format!("unknown isolation mode: {}", other))),
        }
    }
}

/// Complexity tier estimated by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    #[default]
    Medium,
    Complex,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Trivial => write!(f, "trivial"),
            Complexity::Simple => write!(f, "simple"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

impl std::str::FromStr for Complexity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "trivial" => Ok(Complexity::Trivial),
            "simple" => Ok(Complexity::Simple),
            "medium" => Ok(Complexity::Medium),
            "complex" => Ok(Complexity::Complex),
            other => Err(Error::Validation(format!("unknown complexity tier: {}", other))),
        }
    }
}

/// One deterministic verification check.
///
/// Accepts either a bare command string or a `{ name, command }` table
/// when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CheckRepr")]
pub struct VerificationCheck {
    /// Label used in reports; defaults to the command itself.
    pub name: String,
    /// Shell command; exit code 0 means pass.
    pub command: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CheckRepr {
    Command(String),
    Named {
        name: Option<String>,
        command: String,
    },
}

impl From<CheckRepr> for VerificationCheck {
    fn from(repr: CheckRepr) -> Self {
        match repr {
            CheckRepr::Command(command) => VerificationCheck::new(command),
            CheckRepr::Named { name, command } => match name {
                Some(name) => VerificationCheck::named(name, command),
                None => VerificationCheck::new(command),
            },
        }
    }
}

impl VerificationCheck {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            name: command.clone(),
            command,
        }
    }

    pub fn named(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// A task as produced by the planning collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Exported interface the implementation must satisfy. Opaque.
    #[serde(default)]
    pub contract: String,
    /// Interface text of the dependencies, handed to the agent as context.
    #[serde(default)]
    pub dependency_interfaces: String,
    #[serde(default)]
    pub test_spec: String,
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
    #[serde(default)]
    pub verification: Vec<VerificationCheck>,
    #[serde(default, alias = "estimated_complexity")]
    pub complexity: Complexity,
    /// Per-task override of the run's isolation mode.
    #[serde(default)]
    pub isolation: Option<IsolationMode>,
}

impl TaskDefinition {
    pub fn new(id: impl Into<TaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            depends_on: Vec::new(),
            contract: String::new(),
            dependency_interfaces: String::new(),
            test_spec: String::new(),
            output_files: Vec::new(),
            verification: Vec::new(),
            complexity: Complexity::default(),
            isolation: None,
        }
    }

    pub fn depends_on<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_contract(mut self, contract: &str) -> Self {
        self.contract = contract.to_string();
        self
    }

    pub fn with_check(mut self, command: &str) -> Self {
        self.verification.push(VerificationCheck::new(command));
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_files.push(path.into());
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_isolation(mut self, mode: IsolationMode) -> Self {
        self.isolation = Some(mode);
        self
    }
}

/// Why a task is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BlockReason {
    /// Escalation exhausted: the ladder reached `Rung::Human` and only a
    /// human decision releases the task.
    Escalated { summary: String },
    /// A (transitive) dependency is blocked.
    Upstream { task: TaskId },
    /// The operator cancelled the running attempt.
    Cancelled,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Escalated { summary } => write!(f, "escalated: {}", summary),
            BlockReason::Upstream { task } => write!(f, "upstream {} is blocked", task),
            BlockReason::Cancelled => write!(f, "cancelled by operator"),
        }
    }
}

/// A runtime node in the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub definition: TaskDefinition,
    pub status: TaskStatus,
    /// Number of execution attempts started so far.
    pub attempt_count: u32,
    /// Effective isolation mode (override or run default).
    pub isolation_mode: IsolationMode,
    /// Compile order; the FIFO tie-break.
    pub order: usize,
    /// Parent task when this task came out of a decomposition.
    pub decomposed_from: Option<TaskId>,
    /// Children that replaced this task, if decomposed.
    pub replaced_by: Vec<TaskId>,
    pub block_reason: Option<BlockReason>,
    /// Failure notes carried into the next attempt's context.
    pub retry_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Commit on the run branch holding this task's output.
    pub commit_hash: Option<String>,
}

impl Task {
    /// Create a pending task from its definition.
    pub fn new(definition: TaskDefinition, run_isolation: IsolationMode, order: usize) -> Self {
        let isolation_mode = definition.isolation.unwrap_or(run_isolation);
        Self {
            definition,
            status: TaskStatus::Pending,
            attempt_count: 0,
            isolation_mode,
            order,
            decomposed_from: None,
            replaced_by: Vec::new(),
            block_reason: None,
            retry_context: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            commit_hash: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.definition.id
    }

    pub fn depends_on(&self) -> &[TaskId] {
        &self.definition.depends_on
    }

    /// Move to `to`, rejecting illegal lifecycle steps.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                task: self.id().clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Claim for dispatch: `pending -> ready`.
    pub fn mark_ready(&mut self) -> Result<()> {
        self.transition(TaskStatus::Ready)
    }

    /// Hand to the driver: `ready -> in_progress`, counting the attempt.
    pub fn start_attempt(&mut self) -> Result<u32> {
        self.transition(TaskStatus::InProgress)?;
        self.attempt_count += 1;
        self.started_at = Some(Utc::now());
        Ok(self.attempt_count)
    }

    pub fn begin_verifying(&mut self) -> Result<()> {
        self.transition(TaskStatus::Verifying)
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.block_reason = None;
        Ok(())
    }

    pub fn fail(&mut self) -> Result<()> {
        self.transition(TaskStatus::Failed)
    }

    pub fn block(&mut self, reason: BlockReason) -> Result<()> {
        self.transition(TaskStatus::Blocked)?;
        self.block_reason = Some(reason);
        Ok(())
    }

    /// Back to `pending`, from `blocked` (human decision / upstream
    /// recovered) or `failed` (retry).
    pub fn reset_to_pending(&mut self) -> Result<()> {
        self.transition(TaskStatus::Pending)?;
        self.block_reason = None;
        Ok(())
    }

    pub fn mark_decomposed(&mut self, children: Vec<TaskId>) -> Result<()> {
        self.transition(TaskStatus::Decomposed)?;
        self.replaced_by = children;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn set_commit(&mut self, hash: &str) {
        self.commit_hash = Some(hash.to_string());
    }

    /// Blocked because of an escalation or cancellation on this task itself.
    pub fn is_blocked_at_source(&self) -> bool {
        self.status == TaskStatus::Blocked
            && !matches!(self.block_reason, Some(BlockReason::Upstream { .. }))
    }
}
