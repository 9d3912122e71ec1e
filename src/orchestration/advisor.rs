//! Recovery advisor: the capability consulted on the decompose and
//! peer-review rungs of the escalation ladder.
//!
//! The engine only depends on the `RecoveryAdvisor` trait. `CommandAdvisor`
//! asks a second headless agent and parses its one-word verdict.

use crate::core::task::{TaskDefinition, TaskId};
use crate::error::{Error, Result};
use crate::util::tail;
use crate::{clog_debug, clog_warn};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default time an advisor gets to answer.
pub const DEFAULT_ADVISOR_TIMEOUT_SECS: u64 = 600;
const REPORT_OUTPUT_LIMIT: usize = 4000;

/// Extra guidance for the next attempt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetryContext {
    pub notes: String,
    /// Replacement definition (same id) to use from now on.
    pub revised: Option<TaskDefinition>,
}

impl RetryContext {
    pub fn notes(notes: impl Into<String>) -> Self {
        Self {
            notes: notes.into(),
            revised: None,
        }
    }
}

/// What the advisor recommends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum RecoveryDecision {
    Retry(RetryContext),
    Decompose { children: Vec<TaskDefinition> },
    Escalate { reason: String },
}

impl RecoveryDecision {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryDecision::Retry(_) => "retry",
            RecoveryDecision::Decompose { .. } => "decompose",
            RecoveryDecision::Escalate { .. } => "escalate",
        }
    }
}

/// Everything the advisor gets to look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub task: TaskDefinition,
    pub attempts: u32,
    pub cause: String,
    pub failed_check: Option<String>,
    pub check_output: Option<String>,
    pub recent_output: String,
    pub errors: Vec<String>,
    /// Earlier ladder steps, oldest first.
    pub history: Vec<String>,
    pub workspace: PathBuf,
}

impl FailureReport {
    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }
}

pub trait RecoveryAdvisor: Send + Sync {
    /// Propose two or more smaller tasks that together satisfy the failed
    /// task's contract.
    fn propose_decomposition(&self, report: FailureReport) -> BoxFuture<'static, Result<RecoveryDecision>>;

    /// Look at a failure with fresh eyes: retry with guidance, or escalate.
    fn review_failure(&self, report: FailureReport) -> BoxFuture<'static, Result<RecoveryDecision>>;
}

/// Advisor that always escalates. Used when no reviewer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscalatingAdvisor;

impl RecoveryAdvisor for EscalatingAdvisor {
    fn propose_decomposition(&self, _report: FailureReport) -> BoxFuture<'static, Result<RecoveryDecision>> {
        Box::pin(async {
            Ok(RecoveryDecision::Escalate {
                reason: "no advisor configured".to_string(),
            })
        })
    }

    fn review_failure(&self, _report: FailureReport) -> BoxFuture<'static, Result<RecoveryDecision>> {
        Box::pin(async {
            Ok(RecoveryDecision::Escalate {
                reason: "no advisor configured".to_string(),
            })
        })
    }
}

/// Asks a headless agent command (prompt on stdin, answer on stdout).
#[derive(Debug, Clone)]
pub struct CommandAdvisor {
    command: String,
    timeout: Duration,
}

impl CommandAdvisor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(DEFAULT_ADVISOR_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn ask(&self, prompt: String, workspace: PathBuf) -> Result<String> {
        clog_debug!("CommandAdvisor::ask cmd={} prompt_len={}", self.command, prompt.len());
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::AgentNotAvailable(format!(
                "advisor exited with {}: {}",
                output.status,
                tail(stderr.trim(), 500)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RecoveryAdvisor for CommandAdvisor {
    fn propose_decomposition(&self, report: FailureReport) -> BoxFuture<'static, Result<RecoveryDecision>> {
        let advisor = self.clone();
        Box::pin(async move {
            let prompt = build_decomposition_prompt(&report);
            let response = advisor.ask(prompt, report.workspace.clone()).await?;
            Ok(parse_recovery_decision(&response))
        })
    }

    fn review_failure(&self, report: FailureReport) -> BoxFuture<'static, Result<RecoveryDecision>> {
        let advisor = self.clone();
        Box::pin(async move {
            let prompt = build_review_prompt(&report);
            let response = advisor.ask(prompt, report.workspace.clone()).await?;
            Ok(parse_recovery_decision(&response))
        })
    }
}

fn describe_failure(report: &FailureReport) -> String {
    let mut text = format!(
        "TASK {}: {}\n\nCONTRACT:\n{}\n\nATTEMPTS SO FAR: {}\nFAILURE: {}\n",
        report.task.id, report.task.title, report.task.contract, report.attempts, report.cause
    );
    if let (Some(check), Some(output)) = (&report.failed_check, &report.check_output) {
        text.push_str(&format!(
            "\nFAILING CHECK: {}\n{}\n",
            check,
            tail(output, REPORT_OUTPUT_LIMIT)
        ));
    }
    if !report.errors.is_empty() {
        text.push_str(&format!("\nERRORS:\n{}\n", report.errors.join("\n")));
    }
    if !report.recent_output.is_empty() {
        text.push_str(&format!(
            "\nRECENT AGENT OUTPUT:\n{}\n",
            tail(&report.recent_output, REPORT_OUTPUT_LIMIT)
        ));
    }
    if !report.history.is_empty() {
        text.push_str(&format!("\nRECOVERY HISTORY:\n{}\n", report.history.join("\n")));
    }
    text
}

pub fn build_decomposition_prompt(report: &FailureReport) -> String {
    format!(
        r#"A coding task failed repeatedly. Split it into smaller tasks.

{}
Respond with DECOMPOSE on the first line, followed by a JSON array of two or
more tasks. Each task is an object with "id" (use "{}.1", "{}.2", ...),
"title", "depends_on" (ids of sibling tasks only), "contract",
"output_files" and "verification" (a list of shell commands that exit 0 on
success). If the task cannot be split, respond with ESCALATE and a reason
on the next line."#,
        describe_failure(report),
        report.task.id,
        report.task.id
    )
}

pub fn build_review_prompt(report: &FailureReport) -> String {
    format!(
        r#"Review this failed coding task as a peer.

{}
Respond with EXACTLY one of:
RETRY - followed by concrete guidance for the next attempt on the lines below
ESCALATE - followed by a brief reason for a human on the next line"#,
        describe_failure(report)
    )
}

/// Parse an advisor answer. Anything unrecognised escalates.
pub fn parse_recovery_decision(response: &str) -> RecoveryDecision {
    let trimmed = response.trim();
    let (first, rest) = match trimmed.split_once('\n') {
        Some((first, rest)) => (first.trim(), rest.trim()),
        None => (trimmed, ""),
    };
    let verdict = first.to_uppercase();
    let inline = first
        .split_once(|c: char| c == ':' || c == '-' || c.is_whitespace())
        .map(|(_, after)| after.trim_start_matches([':', '-', ' ']).trim())
        .unwrap_or("");

    if verdict.starts_with("RETRY") {
        let notes = [inline, rest]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        RecoveryDecision::Retry(RetryContext::notes(notes))
    } else if verdict.starts_with("DECOMPOSE") {
        match parse_children(trimmed) {
            Some(children) if children.len() >= 2 => RecoveryDecision::Decompose { children },
            Some(_) => RecoveryDecision::Escalate {
                reason: "advisor proposed fewer than two subtasks".to_string(),
            },
            None => {
                clog_warn!("Could not parse decomposition from advisor response");
                RecoveryDecision::Escalate {
                    reason: "advisor decomposition was not valid JSON".to_string(),
                }
            }
        }
    } else if verdict.starts_with("ESCALATE") {
        let reason = if !inline.is_empty() {
            inline.to_string()
        } else {
            rest.lines()
                .next()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| "advisor recommended escalation".to_string())
        };
        RecoveryDecision::Escalate { reason }
    } else {
        RecoveryDecision::Escalate {
            reason: format!("unrecognised advisor response: {}", tail(first, 200)),
        }
    }
}

fn parse_children(text: &str) -> Option<Vec<TaskDefinition>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
