//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A scripted `ExecutionDriver` standing in for coding agents
//! - A scripted `RecoveryAdvisor`
//! - Starting a run and collecting its events

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use conductor::core::{GraphBuilder, IsolationMode, TaskDefinition, TaskId};
use conductor::orchestration::{
    ExecutionDriver, ExecutionHandle, ExecutionRequest, FailureReport, OutputChunk,
    RecoveryAdvisor, RecoveryDecision, RunController, RunEvent, RunHandle, DONE_MARKER,
};
use conductor::session::{RunSession, RunStore};
use conductor::{Config, ExecutionError, Result};
use futures::future::BoxFuture;

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
    /// Where run worktrees are created.
    pub worktrees: TempDir,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Self {
            temp_dir,
            path,
            worktrees: TempDir::new().expect("Failed to create worktree directory"),
        };

        repo.git(&["init"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        std::fs::write(repo.path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "Initial commit"]);
        repo
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        !self.git(&["branch", "--list", name]).is_empty()
    }

    /// Content of `path` at the tip of `branch`, if committed there.
    pub fn file_at(&self, branch: &str, path: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{}:{}", branch, path)])
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git show");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Commit subjects on `branch`, newest first.
    pub fn log_subjects(&self, branch: &str) -> Vec<String> {
        self.git(&["log", "--format=%s", branch])
            .lines()
            .map(String::from)
            .collect()
    }

    pub fn store(&self) -> RunStore {
        RunStore::for_repo(&self.path)
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// What the scripted agent does on one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Write `out/<task>.txt`, print the done marker, exit 0.
    Succeed,
    /// Exit 0 without writing anything.
    Idle,
    /// Exit with this code.
    Exit(i32),
    /// Leave `scratch/<task>.wip` half written and run until cancelled.
    Hang,
    /// Fail to launch.
    Refuse,
}

/// One `submit` call as the driver saw it.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: TaskId,
    pub attempt: u32,
    pub isolation: IsolationMode,
    pub prior_failure: Option<String>,
    pub prompt: String,
}

/// Driver that plays back a per-task script of steps.
///
/// Tasks without a script (or past its end) succeed.
pub struct ScriptedDriver {
    scripts: Mutex<HashMap<TaskId, VecDeque<Step>>>,
    delay: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    submissions: Mutex<Vec<Submission>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delay: Duration::from_millis(50),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, task: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(TaskId::from(task), steps.into_iter().collect());
        self
    }

    /// Most agents ever running at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submissions_for(&self, task: &str) -> Vec<Submission> {
        self.submissions()
            .into_iter()
            .filter(|s| s.task_id.as_str() == task)
            .collect()
    }

    fn next_step(&self, task_id: &TaskId) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(task_id)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed)
    }
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionDriver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn submit(&self, request: ExecutionRequest, cancel: CancellationToken) -> Result<ExecutionHandle> {
        self.submissions.lock().unwrap().push(Submission {
            task_id: request.task_id.clone(),
            attempt: request.attempt,
            isolation: request.isolation,
            prior_failure: request.context.prior_failure.clone(),
            prompt: request.prompt(),
        });

        let step = self.next_step(&request.task_id);
        if step == Step::Refuse {
            return Err(ExecutionError::Spawn("agent binary missing".to_string()).into());
        }

        let (out_tx, out_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = oneshot::channel();
        let active = Arc::clone(&self.active);
        let max_active = Arc::clone(&self.max_active);
        let delay = self.delay;
        let token = cancel.clone();
        let workspace = request.workspace.clone();
        let task_id = request.task_id.clone();
        let attempt = request.attempt;

        tokio::spawn(async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            let _ = out_tx.send(OutputChunk::stdout(format!("working on {}", task_id))).await;

            let status = match step {
                Step::Hang => {
                    write_scratch(&workspace, &task_id);
                    token.cancelled().await;
                    Err(ExecutionError::Cancelled)
                }
                Step::Succeed => {
                    write_output(&workspace, &task_id, attempt);
                    tokio::time::sleep(delay).await;
                    let _ = out_tx.send(OutputChunk::stdout(DONE_MARKER)).await;
                    Ok(Some(0))
                }
                Step::Idle => {
                    tokio::time::sleep(delay).await;
                    Ok(Some(0))
                }
                Step::Exit(code) => {
                    tokio::time::sleep(delay).await;
                    let _ = out_tx.send(OutputChunk::stderr(format!("fatal: exiting with {}", code))).await;
                    Ok(Some(code))
                }
                Step::Refuse => Err(ExecutionError::Spawn("unreachable".to_string())),
            };

            active.fetch_sub(1, Ordering::SeqCst);
            drop(out_tx);
            let _ = exit_tx.send(status);
        });

        Ok(ExecutionHandle::new(out_rx, exit_rx, cancel))
    }
}

fn write_output(workspace: &Path, task_id: &TaskId, attempt: u32) {
    let dir = workspace.join("out");
    std::fs::create_dir_all(&dir).expect("Failed to create output dir");
    std::fs::write(
        dir.join(format!("{}.txt", task_id)),
        format!("{} attempt {}\n", task_id, attempt),
    )
    .expect("Failed to write output");
}

fn write_scratch(workspace: &Path, task_id: &TaskId) {
    let dir = workspace.join("scratch");
    std::fs::create_dir_all(&dir).expect("Failed to create scratch dir");
    std::fs::write(dir.join(format!("{}.wip", task_id)), "half done\n").expect("Failed to write scratch");
}

/// Advisor that answers from queues; an empty queue escalates.
#[derive(Default)]
pub struct ScriptedAdvisor {
    decompositions: Mutex<VecDeque<RecoveryDecision>>,
    reviews: Mutex<VecDeque<RecoveryDecision>>,
    calls: Mutex<Vec<(&'static str, TaskId)>>,
}

impl ScriptedAdvisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decompose_into(self, children: Vec<TaskDefinition>) -> Self {
        self.decompositions
            .lock()
            .unwrap()
            .push_back(RecoveryDecision::Decompose { children });
        self
    }

    pub fn review(self, decision: RecoveryDecision) -> Self {
        self.reviews.lock().unwrap().push_back(decision);
        self
    }

    /// `(kind, task)` for every call, in order.
    pub fn calls(&self) -> Vec<(&'static str, TaskId)> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, kind: &'static str, report: &FailureReport) -> RecoveryDecision {
        self.calls.lock().unwrap().push((kind, report.task_id().clone()));
        let queue = match kind {
            "decompose" => &self.decompositions,
            _ => &self.reviews,
        };
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RecoveryDecision::Escalate {
                reason: format!("no scripted {} answer", kind),
            })
    }
}

impl RecoveryAdvisor for ScriptedAdvisor {
    fn propose_decomposition(&self, report: FailureReport) -> BoxFuture<'static, Result<RecoveryDecision>> {
        let decision = self.answer("decompose", &report);
        Box::pin(async move { Ok(decision) })
    }

    fn review_failure(&self, report: FailureReport) -> BoxFuture<'static, Result<RecoveryDecision>> {
        let decision = self.answer("review", &report);
        Box::pin(async move { Ok(decision) })
    }
}

/// Config with short timeouts and no advisor rungs.
pub fn test_config(concurrency: usize) -> Config {
    Config {
        concurrency,
        max_retries: 2,
        task_timeout_secs: 30,
        verification_timeout_secs: 10,
        commit_poll_ms: 100,
        decompose: false,
        peer_review: false,
        ..Config::default()
    }
}

/// A task that must produce `out/<id>.txt`.
pub fn task(id: &str, deps: &[&str]) -> TaskDefinition {
    TaskDefinition::new(id, &format!("{} task", id))
        .depends_on(deps.iter().copied())
        .with_contract(&format!("write out/{}.txt", id))
        .with_output(format!("out/{}.txt", id))
        .with_check(&format!("test -f out/{}.txt", id))
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

/// A live run with its operator handle and event stream.
pub struct TestRun {
    pub controller: RunController,
    pub handle: RunHandle,
    pub events: mpsc::UnboundedReceiver<RunEvent>,
    pub session: RunSession,
}

/// Compile `defs`, create the run branch in `repo` and wire a controller.
pub async fn start_run(
    repo: &TestRepo,
    config: Config,
    defs: Vec<TaskDefinition>,
    driver: Arc<ScriptedDriver>,
    advisor: Arc<ScriptedAdvisor>,
) -> TestRun {
    let graph = GraphBuilder::new(config.isolation)
        .build(defs)
        .expect("Failed to build graph");
    let session = RunSession::create(&repo.path, config, Some(repo.worktrees.path()))
        .await
        .expect("Failed to create run session");
    let (controller, handle) = RunController::new(session.clone(), graph, driver, advisor);
    let mut controller = controller.with_store(repo.store());
    let events = controller.subscribe();
    TestRun {
        controller,
        handle,
        events,
        session,
    }
}

/// Every event left in the stream; returns once the controller is gone.
pub async fn collect_events(events: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}

/// Wait (bounded) for the first event matching `pred`, keeping everything
/// seen on the way.
pub async fn wait_for<F>(
    events: &mut mpsc::UnboundedReceiver<RunEvent>,
    seen: &mut Vec<RunEvent>,
    pred: F,
) -> RunEvent
where
    F: Fn(&RunEvent) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(event) = events.recv().await {
            seen.push(event.clone());
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .expect("Timed out waiting for run event");
    found.expect("Event stream closed before the expected event")
}

/// Assert every task started only after all of its dependencies completed.
pub fn assert_no_false_starts(events: &[RunEvent], deps: &[(&str, &[&str])]) {
    let deps: HashMap<&str, &[&str]> = deps.iter().copied().collect();
    let mut completed: HashSet<String> = HashSet::new();
    for event in events {
        match event {
            RunEvent::TaskCompleted { task_id, .. } => {
                completed.insert(task_id.to_string());
            }
            RunEvent::TaskStarted { task_id, .. } => {
                for dep in deps.get(task_id.as_str()).copied().unwrap_or(&[]) {
                    assert!(
                        completed.contains(*dep),
                        "{} started before its dependency {} completed",
                        task_id,
                        dep
                    );
                }
            }
            _ => {}
        }
    }
}

/// Ids of started tasks, in start order (one entry per attempt).
pub fn start_order(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskStarted { task_id, .. } => Some(task_id.to_string()),
            _ => None,
        })
        .collect()
}
