//! Materialized task context handed to an agent.

use crate::core::task::{TaskDefinition, TaskId};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Line an agent prints to claim it is done. Advisory only: completion is
/// decided by verification.
pub const DONE_MARKER: &str = "CONDUCTOR: DONE";

/// Everything an agent sees for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub attempt: u32,
    pub title: String,
    pub contract: String,
    pub dependency_interfaces: String,
    pub test_spec: String,
    pub output_files: Vec<PathBuf>,
    /// Verification commands, so the agent can run them itself.
    pub checks: Vec<String>,
    /// What went wrong last time, if this is a retry.
    pub prior_failure: Option<String>,
}

impl TaskContext {
    pub fn new(definition: &TaskDefinition, attempt: u32, prior_failure: Option<String>) -> Self {
        Self {
            task_id: definition.id.clone(),
            attempt,
            title: definition.title.clone(),
            contract: definition.contract.clone(),
            dependency_interfaces: definition.dependency_interfaces.clone(),
            test_spec: definition.test_spec.clone(),
            output_files: definition.output_files.clone(),
            checks: definition
                .verification
                .iter()
                .map(|c| c.command.clone())
                .collect(),
            prior_failure,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.prior_failure.is_some()
    }

    /// Render as a markdown prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Task {}: {}", self.task_id, self.title);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Implement exactly this task. Do not modify files outside the output list."
        );
        section(&mut out, "Contract", &self.contract);
        section(&mut out, "Dependencies (Interfaces Only)", &self.dependency_interfaces);
        section(&mut out, "Test Specification", &self.test_spec);

        if !self.output_files.is_empty() {
            let _ = writeln!(out, "\n## Output Files\n");
            for path in &self.output_files {
                let _ = writeln!(out, "- {}", path.display());
            }
        }

        if !self.checks.is_empty() {
            let _ = writeln!(out, "\n## Verification\n");
            let _ = writeln!(out, "All of these must exit 0:\n\n```bash");
            for check in &self.checks {
                let _ = writeln!(out, "{}", check);
            }
            let _ = writeln!(out, "```");
        }

        if let Some(failure) = &self.prior_failure {
            let _ = writeln!(
                out,
                "\n## Previous Attempt Failed\n\nThis is attempt {}. Fix the problem below.\n",
                self.attempt
            );
            let _ = writeln!(out, "{}", failure.trim_end());
        }

        let _ = writeln!(out, "\nWhen you are finished, print `{}` on its own line.", DONE_MARKER);
        out
    }
}

fn section(out: &mut String, heading: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    let _ = writeln!(out, "\n## {}\n\n{}", heading, body.trim_end());
}
