use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;

/// Errors raised while compiling task definitions into a graph.
///
/// Any of these is fatal: the run never starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("dependency cycle detected: {}", format_ids(.0))]
    Cycle(Vec<TaskId>),

    #[error("task {task} depends on unknown task {missing}")]
    DanglingReference { task: TaskId, missing: TaskId },

    #[error("duplicate task id: {0}")]
    DuplicateId(TaskId),

    #[error("task {0} declares no verification checks")]
    NoVerification(TaskId),

    #[error("task definition at position {0} has an empty id")]
    EmptyId(usize),
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Why an attempt ended without a clean exit.
///
/// These are data for the failure handler, never a reason to stop the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("agent exited with status {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Crash { code: Option<i32> },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to launch agent: {0}")]
    Spawn(String),

    #[error("attempt cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Graph build error: {0}")]
    Build(#[from] BuildError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid status transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Attempt pool is full (max: {max})")]
    PoolFull { max: usize },

    #[error("Run is {0}; operation not permitted")]
    RunInactive(String),

    #[error("Task file parse error in {file}: {message}")]
    TaskFile { file: String, message: String },

    #[error("Merge conflict in {}", .0.join(", "))]
    MergeConflict(Vec<String>),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

pub type Result<T> = std::result::Result<T, Error>;
