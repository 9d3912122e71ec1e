//! Deterministic verification of a finished attempt.
//!
//! Checks are shell commands run in the workspace, in declared order. The
//! first failure stops the run and is reported with its output.

use crate::core::event::{AttemptLog, EventKind};
use crate::core::task::VerificationCheck;
use crate::util::tail;
use crate::{clog_debug, clog_warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const DEFAULT_OUTPUT_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum Verdict {
    Passed,
    Failed { failed_check: String, output: String },
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    workspace: PathBuf,
    timeout: Duration,
    output_limit: usize,
}

impl Verifier {
    pub fn new(workspace: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workspace: workspace.into(),
            timeout,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Run `checks`, fail-fast, recording a `check` event per check run.
    ///
    /// An empty check list never passes.
    pub async fn verify(&self, checks: &[VerificationCheck], log: &mut AttemptLog) -> Verdict {
        if checks.is_empty() {
            return Verdict::Failed {
                failed_check: String::new(),
                output: "no verification checks declared".to_string(),
            };
        }

        for check in checks {
            let (passed, output) = self.run_check(check).await;
            log.record(EventKind::Check {
                name: check.name.clone(),
                passed,
            });
            if !passed {
                clog_debug!("Check '{}' failed for {}", check.name, log.task_id());
                return Verdict::Failed {
                    failed_check: check.name.clone(),
                    output,
                };
            }
        }
        Verdict::Passed
    }

    async fn run_check(&self, check: &VerificationCheck) -> (bool, String) {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&check.command)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                (output.status.success(), tail(&text, self.output_limit).to_string())
            }
            Ok(Err(e)) => {
                clog_warn!("Could not run check '{}': {}", check.name, e);
                (false, format!("could not run `{}`: {}", check.command, e))
            }
            Err(_) => (
                false,
                format!("`{}` timed out after {:?}", check.command, self.timeout),
            ),
        }
    }
}
