//! Failure handler: the bounded escalation ladder.
//!
//! A failed attempt climbs, in order: retry with context (up to
//! `max_retries`), decompose (once, and never a task that is itself a
//! decomposition child), peer review (up to `max_peer_reviews`), then a
//! human. Each task keeps its own ladder state.

use crate::config::Config;
use crate::core::event::{AttemptLog, Rung};
use crate::core::task::{BlockReason, Task, TaskId};
use crate::error::ExecutionError;
use crate::orchestration::advisor::FailureReport;
use crate::util::tail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const NOTES_OUTPUT_LIMIT: usize = 3000;
const NOTES_OUTPUT_LINES: usize = 40;

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum FailureCause {
    /// Crash, timeout, launch failure or cancellation.
    Execution { error: ExecutionErrorRecord },
    /// The agent exited cleanly but a check failed.
    Verification { failed_check: String, output: String },
    /// Checks passed but the output could not be put on the run branch.
    Integration { message: String },
}

/// Serializable form of an `ExecutionError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionErrorRecord {
    pub message: String,
}

impl From<&ExecutionError> for FailureCause {
    fn from(error: &ExecutionError) -> Self {
        FailureCause::Execution {
            error: ExecutionErrorRecord {
                message: error.to_string(),
            },
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Execution { error } => write!(f, "execution error: {}", error.message),
            FailureCause::Verification { failed_check, .. } => {
                write!(f, "verification failed: {}", failed_check)
            }
            FailureCause::Integration { message } => write!(f, "integration failed: {}", message),
        }
    }
}

/// One rung taken, for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderStep {
    pub attempt: u32,
    pub rung: Rung,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for LadderStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attempt {}: {} ({})", self.attempt, self.rung, self.detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LadderState {
    pub retries_used: u32,
    pub decompose_tried: bool,
    pub peer_reviews_used: u32,
    pub last_failure: Option<FailureCause>,
    /// Attempts made before the current cycle; a human retry starts a new one.
    pub cycle_start: u32,
    /// Latest peer-review recommendation, shown to the human.
    pub review_notes: Option<String>,
    pub history: Vec<LadderStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderPolicy {
    pub max_retries: u32,
    pub decompose: bool,
    pub peer_review: bool,
    pub max_peer_reviews: u32,
    /// Attempts allowed per ladder cycle, across every rung.
    pub max_attempts: u32,
}

impl Default for LadderPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl LadderPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            decompose: config.decompose,
            peer_review: config.peer_review,
            max_peer_reviews: config.max_peer_reviews,
            max_attempts: config.max_attempts_per_task(),
        }
    }
}

/// Concise view of a blocked task for the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedSummary {
    pub task_id: TaskId,
    pub title: String,
    pub attempts: u32,
    pub reason: Option<BlockReason>,
    pub last_failure: Option<String>,
    pub peer_review: Option<String>,
    pub history: Vec<LadderStep>,
}

impl std::fmt::Display for BlockedSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) after {} attempt(s)", self.task_id, self.title, self.attempts)?;
        if let Some(reason) = &self.reason {
            write!(f, ": {}", reason)?;
        }
        if let Some(failure) = &self.last_failure {
            write!(f, "\n  last failure: {}", failure)?;
        }
        if let Some(review) = &self.peer_review {
            write!(f, "\n  peer review: {}", review)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FailureHandler {
    policy: LadderPolicy,
    ladders: HashMap<TaskId, LadderState>,
}

impl FailureHandler {
    pub fn new(policy: LadderPolicy) -> Self {
        Self {
            policy,
            ladders: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &LadderPolicy {
        &self.policy
    }

    pub fn ladder(&self, task_id: &TaskId) -> Option<&LadderState> {
        self.ladders.get(task_id)
    }

    /// Remember the cause of the latest failure.
    pub fn record_failure(&mut self, task_id: &TaskId, cause: FailureCause) {
        self.ladders.entry(task_id.clone()).or_default().last_failure = Some(cause);
    }

    /// Pick the next rung for a failed task and count it as used.
    ///
    /// Rungs that run the task again are skipped once the cycle has used
    /// `max_attempts`.
    pub fn next_rung(&mut self, task: &Task) -> Rung {
        let policy = self.policy;
        let ladder = self.ladders.entry(task.id().clone()).or_default();
        let may_rerun = task.attempt_count.saturating_sub(ladder.cycle_start) < policy.max_attempts;

        if may_rerun && ladder.retries_used < policy.max_retries {
            ladder.retries_used += 1;
            Rung::Retry
        } else if policy.decompose && !ladder.decompose_tried && task.decomposed_from.is_none() {
            ladder.decompose_tried = true;
            Rung::Decompose
        } else if may_rerun && policy.peer_review && ladder.peer_reviews_used < policy.max_peer_reviews {
            ladder.peer_reviews_used += 1;
            Rung::PeerReview
        } else {
            Rung::Human
        }
    }

    /// Append a step to the task's audit trail.
    pub fn note_step(&mut self, task_id: &TaskId, attempt: u32, rung: Rung, detail: impl Into<String>) -> LadderStep {
        let step = LadderStep {
            attempt,
            rung,
            detail: detail.into(),
            at: Utc::now(),
        };
        self.ladders
            .entry(task_id.clone())
            .or_default()
            .history
            .push(step.clone());
        step
    }

    pub fn set_review_notes(&mut self, task_id: &TaskId, notes: &str) {
        self.ladders.entry(task_id.clone()).or_default().review_notes = Some(notes.to_string());
    }

    /// Start a new cycle after a human decision. History is kept.
    pub fn reset(&mut self, task: &Task) {
        let ladder = self.ladders.entry(task.id().clone()).or_default();
        ladder.retries_used = 0;
        ladder.decompose_tried = false;
        ladder.peer_reviews_used = 0;
        ladder.cycle_start = task.attempt_count;
    }

    /// Context for the next attempt: the failure, the failing check's
    /// output and the tail of the previous attempt's events.
    pub fn retry_notes(cause: &FailureCause, log: &AttemptLog) -> String {
        let mut notes = format!("Attempt {} failed: {}\n", log.attempt(), cause);
        if let FailureCause::Verification { failed_check, output } = cause {
            notes.push_str(&format!(
                "\nFailing check `{}` output:\n{}\n",
                failed_check,
                tail(output, NOTES_OUTPUT_LIMIT)
            ));
        }
        let errors: Vec<&str> = log.errors().collect();
        if !errors.is_empty() {
            notes.push_str(&format!("\nErrors:\n{}\n", errors.join("\n")));
        }
        let output = log.output_tail(NOTES_OUTPUT_LINES);
        if !output.is_empty() {
            notes.push_str(&format!(
                "\nLast agent output:\n{}\n",
                tail(&output, NOTES_OUTPUT_LIMIT)
            ));
        }
        notes
    }

    pub fn failure_report(&self, task: &Task, log: &AttemptLog, workspace: &Path) -> FailureReport {
        let ladder = self.ladders.get(task.id());
        let cause = ladder.and_then(|l| l.last_failure.clone());
        let (failed_check, check_output) = match &cause {
            Some(FailureCause::Verification { failed_check, output }) => {
                (Some(failed_check.clone()), Some(output.clone()))
            }
            _ => (None, None),
        };
        FailureReport {
            task: task.definition.clone(),
            attempts: task.attempt_count,
            cause: cause
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown failure".to_string()),
            failed_check,
            check_output,
            recent_output: log.output_tail(NOTES_OUTPUT_LINES),
            errors: log.errors().map(String::from).collect(),
            history: ladder
                .map(|l| l.history.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
            workspace: workspace.to_path_buf(),
        }
    }

    pub fn blocked_summary(&self, task: &Task) -> BlockedSummary {
        let ladder = self.ladders.get(task.id());
        BlockedSummary {
            task_id: task.id().clone(),
            title: task.definition.title.clone(),
            attempts: task.attempt_count,
            reason: task.block_reason.clone(),
            last_failure: ladder.and_then(|l| l.last_failure.as_ref()).map(|cause| match cause {
                FailureCause::Verification { failed_check, output } => {
                    format!("{}: {}", failed_check, tail(output.trim(), 500))
                }
                other => other.to_string(),
            }),
            peer_review: ladder.and_then(|l| l.review_notes.clone()),
            history: ladder.map(|l| l.history.clone()).unwrap_or_default(),
        }
    }

    pub fn ladders(&self) -> &HashMap<TaskId, LadderState> {
        &self.ladders
    }
}
