//! Execution events: the append-only record of what happened during an
//! attempt.
//!
//! Events are immutable once recorded. Within one attempt they are ordered
//! by a monotonic sequence number, and timestamps never go backwards even
//! if the wall clock does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::task::{TaskId, TaskStatus};

/// Which process stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Kind of filesystem change reported by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChange {
    Created,
    Modified,
    Removed,
}

/// Rungs of the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rung {
    Retry,
    Decompose,
    PeerReview,
    Human,
}

impl std::fmt::Display for Rung {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rung::Retry => write!(f, "retry"),
            Rung::Decompose => write!(f, "decompose"),
            Rung::PeerReview => write!(f, "peer_review"),
            Rung::Human => write!(f, "human"),
        }
    }
}

/// Payload of an execution event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventKind {
    /// A line of agent output.
    Output { stream: OutputStream, text: String },
    /// A file in the workspace changed.
    FileChanged { path: PathBuf, change: FileChange },
    /// The run branch moved to a new commit.
    Commit { hash: String },
    /// The agent process terminated. `None` when killed by a signal.
    Exit { code: Option<i32> },
    /// Something went wrong: ingestion failure, crash, timeout.
    Error { message: String },
    /// The agent claims it is done. Advisory only.
    AgentSignal { message: String },
    /// A verification check finished.
    Check { name: String, passed: bool },
    /// The task's status changed.
    Transition { from: TaskStatus, to: TaskStatus },
    /// The failure handler moved to a ladder rung.
    Escalation { rung: Rung, detail: String },
}

impl EventKind {
    /// Short label used in logs and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Output { .. } => "output",
            EventKind::FileChanged { .. } => "file_changed",
            EventKind::Commit { .. } => "commit",
            EventKind::Exit { .. } => "exit",
            EventKind::Error { .. } => "error",
            EventKind::AgentSignal { .. } => "agent_signal",
            EventKind::Check { .. } => "check",
            EventKind::Transition { .. } => "transition",
            EventKind::Escalation { .. } => "escalation",
        }
    }
}

/// One immutable, timestamped signal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub task_id: TaskId,
    pub attempt: u32,
    /// Position within the attempt, starting at 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Append-only event sequence for one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptLog {
    task_id: TaskId,
    attempt: u32,
    events: Vec<ExecutionEvent>,
}

impl AttemptLog {
    pub fn new(task_id: TaskId, attempt: u32) -> Self {
        Self {
            task_id,
            attempt,
            events: Vec::new(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Append an event stamped with the current time.
    pub fn record(&mut self, kind: EventKind) -> &ExecutionEvent {
        self.record_at(Utc::now(), kind)
    }

    /// Append an event with an explicit timestamp, clamped so the sequence
    /// stays non-decreasing.
    pub fn record_at(&mut self, timestamp: DateTime<Utc>, kind: EventKind) -> &ExecutionEvent {
        let timestamp = match self.events.last() {
            Some(last) if last.timestamp > timestamp => last.timestamp,
            _ => timestamp,
        };
        let seq = self.events.len() as u64;
        self.events.push(ExecutionEvent {
            task_id: self.task_id.clone(),
            attempt: self.attempt,
            seq,
            timestamp,
            kind,
        });
        &self.events[self.events.len() - 1]
    }

    pub fn events(&self) -> &[ExecutionEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Error events, in order.
    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.events.iter().filter_map(|e| match &e.kind {
            EventKind::Error { message } => Some(message.as_str()),
            _ => None,
        })
    }

    /// The last `n` lines of output, joined.
    pub fn output_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self
            .events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Output { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }

    pub fn into_events(self) -> Vec<ExecutionEvent> {
        self.events
    }
}
