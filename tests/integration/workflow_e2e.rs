//! End-to-end run tests.
//!
//! A plan goes in, agents are played back by `ScriptedDriver`, and the run
//! ends with verified output committed on its own branch and a report on
//! disk.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::{EventKind, TaskStatus};
use conductor::error::BuildError;
use conductor::plan::load_plan;
use conductor::{Error, RunController, RunEvent, RunStatus};

use crate::fixtures::{
    assert_no_false_starts, collect_events, id, start_order, start_run, task, test_config,
    wait_for, ScriptedAdvisor, ScriptedDriver, TestRepo,
};

/// Test: Fan-in graph completes
/// Given A and B independent and C depending on both, with a limit of 2
/// When the run executes
/// Then A and B overlap, C starts only after both complete, and the run
/// ends Completed
#[tokio::test]
async fn test_fan_in_graph_completes() {
    let repo = TestRepo::new();
    let driver = Arc::new(ScriptedDriver::new().with_delay(Duration::from_millis(300)));
    let defs = vec![task("A", &[]), task("B", &[]), task("C", &["A", "B"])];

    let mut run = start_run(&repo, test_config(2), defs, Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    let report = run.controller.run().await.unwrap();
    let events = collect_events(&mut run.events).await;

    assert_eq!(report.status, RunStatus::Completed);
    for t in ["A", "B", "C"] {
        assert_eq!(report.task(&id(t)).unwrap().status, TaskStatus::Completed, "{} not completed", t);
        assert_eq!(report.task(&id(t)).unwrap().attempts, 1);
    }
    assert_eq!(driver.max_active(), 2, "A and B should run side by side");
    assert_eq!(start_order(&events).last().map(String::as_str), Some("C"));
    assert_no_false_starts(&events, &[("C", &["A", "B"][..])]);
    assert!(events.contains(&RunEvent::StatusChanged {
        status: RunStatus::Completed
    }));
}

/// Test: Verified output is committed on the run branch
/// Given a two-task chain
/// When the run completes
/// Then each task's declared output is on the run branch, one commit per
/// task, and the base branch is untouched
#[tokio::test]
async fn test_output_committed_on_run_branch() {
    let repo = TestRepo::new();
    let base = repo.git(&["rev-parse", "HEAD"]);
    let defs = vec![task("A", &[]), task("B", &["A"])];

    let run = start_run(&repo, test_config(2), defs, Arc::new(ScriptedDriver::new()), Arc::new(ScriptedAdvisor::new())).await;
    let branch = run.session.branch.clone();
    let report = run.controller.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.base_commit, base);
    assert!(repo.branch_exists(&branch));
    assert_eq!(repo.file_at(&branch, "out/A.txt").as_deref(), Some("A attempt 1\n"));
    assert_eq!(repo.file_at(&branch, "out/B.txt").as_deref(), Some("B attempt 1\n"));

    let subjects = repo.log_subjects(&branch);
    assert_eq!(subjects[0], "B: B task");
    assert_eq!(subjects[1], "A: A task");
    assert_eq!(repo.git(&["rev-parse", "HEAD"]), base, "base branch must not move");

    let commit_a = report.task(&id("A")).unwrap().commit.clone().unwrap();
    assert_eq!(repo.git(&["rev-parse", &format!("{}~1", branch)]), commit_a);
}

/// Test: Dependents see upstream output
/// Given B whose check requires A's output as well as its own
/// When the run executes
/// Then B passes because every task shares the run workspace
#[tokio::test]
async fn test_dependents_see_upstream_output() {
    let repo = TestRepo::new();
    let mut b = task("B", &["A"]);
    b.verification.push(conductor::core::VerificationCheck::named("upstream", "test -f out/A.txt"));

    let run = start_run(
        &repo,
        test_config(1),
        vec![task("A", &[]), b],
        Arc::new(ScriptedDriver::new()),
        Arc::new(ScriptedAdvisor::new()),
    )
    .await;
    let report = run.controller.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
}

/// Test: Report is persisted and complete
/// Given a finished run
/// When its report is loaded back from the run store
/// Then it carries every task and the full event log of each attempt
#[tokio::test]
async fn test_report_persisted() {
    let repo = TestRepo::new();
    let run = start_run(
        &repo,
        test_config(2),
        vec![task("A", &[])],
        Arc::new(ScriptedDriver::new()),
        Arc::new(ScriptedAdvisor::new()),
    )
    .await;
    let report = run.controller.run().await.unwrap();

    let store = repo.store();
    assert_eq!(store.list().unwrap(), vec![report.run_id]);
    let loaded = store.load(&report.run_id).unwrap();
    assert_eq!(loaded.status, RunStatus::Completed);
    assert_eq!(loaded.branch, report.branch);

    let a = loaded.task(&id("A")).unwrap();
    assert_eq!(a.attempt_logs.len(), 1);
    let transitions: Vec<_> = a.attempt_logs[0]
        .events()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Transition { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (TaskStatus::Pending, TaskStatus::Ready),
            (TaskStatus::Ready, TaskStatus::InProgress),
            (TaskStatus::InProgress, TaskStatus::Verifying),
            (TaskStatus::Verifying, TaskStatus::Completed),
        ]
    );
    let kinds: Vec<_> = a.attempt_logs[0].events().iter().map(|e| e.kind.label()).collect();
    assert!(kinds.contains(&"exit"));
    assert!(kinds.contains(&"check"));
    assert!(kinds.contains(&"commit"));

    let seqs: Vec<_> = a.attempt_logs[0].events().iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "events out of order: {:?}", seqs);

    let lines = std::fs::read_to_string(store.events_path(&report.run_id)).unwrap();
    assert_eq!(lines.lines().count(), loaded.events().count());
}

/// Test: Markdown plan directory runs end to end
/// Given a directory of two task files, the second depending on the first
/// When it is loaded and run
/// Then both tasks complete in dependency order
#[tokio::test]
async fn test_plan_directory_runs() {
    let repo = TestRepo::new();
    let plan = tempfile::TempDir::new().unwrap();
    std::fs::write(
        plan.path().join("T-001.md"),
        "---\nid: T-001\ntitle: Lexer\n---\n\n## Contract\n\npub fn lex()\n\n## Output Files\n\n```\nWRITE: out/T-001.txt\n```\n\n## Verification (Deterministic)\n\n```bash\ntest -f out/T-001.txt\n```\n",
    )
    .unwrap();
    std::fs::write(
        plan.path().join("T-002.md"),
        "---\nid: T-002\ndepends_on: [T-001]\n---\n\n# T-002: Parser\n\n## Output Files\n\n```\nWRITE: out/T-002.txt\n```\n\n## Verification (Deterministic)\n\n```bash\ntest -f out/T-001.txt\ntest -f out/T-002.txt\n```\n",
    )
    .unwrap();

    let defs = load_plan(plan.path()).unwrap();
    assert_eq!(defs[1].title, "Parser");
    let driver = Arc::new(ScriptedDriver::new());
    let mut run = start_run(&repo, test_config(2), defs, Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    let report = run.controller.run().await.unwrap();
    let events = collect_events(&mut run.events).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(start_order(&events), vec!["T-001", "T-002"]);
    assert!(driver.submissions_for("T-001")[0].prompt.contains("pub fn lex()"));
}

/// Test: Invalid graphs never touch the repository
/// Given definitions with a cycle
/// When a run is prepared
/// Then a cycle error naming its members comes back and no branch exists
#[tokio::test]
async fn test_prepare_rejects_cycle() {
    let repo = TestRepo::new();
    let defs = vec![task("A", &["C"]), task("B", &["A"]), task("C", &["B"]), task("D", &[])];

    let result = RunController::prepare(&repo.path, defs, test_config(2), Some(repo.worktrees.path())).await;

    match result {
        Err(Error::Build(BuildError::Cycle(members))) => {
            assert!(members.contains(&id("A")));
            assert!(!members.contains(&id("D")));
        }
        Err(other) => panic!("expected a cycle error, got {}", other),
        Ok(_) => panic!("expected a cycle error"),
    }
    assert!(repo.git(&["branch", "--list", "conductor/*"]).is_empty());
}

/// Test: Pause holds dispatch, resume continues
/// Given a chain A -> B
/// When the operator pauses while A runs and resumes after A completes
/// Then B does not start while paused and the run completes after resume
#[tokio::test]
async fn test_pause_and_resume() {
    let repo = TestRepo::new();
    let driver = Arc::new(ScriptedDriver::new().with_delay(Duration::from_millis(300)));
    let mut run = start_run(
        &repo,
        test_config(2),
        vec![task("A", &[]), task("B", &["A"])],
        Arc::clone(&driver),
        Arc::new(ScriptedAdvisor::new()),
    )
    .await;
    let handle = run.handle.clone();
    let running = tokio::spawn(run.controller.run());

    let mut seen = Vec::new();
    wait_for(&mut run.events, &mut seen, |e| matches!(e, RunEvent::TaskStarted { .. })).await;
    handle.pause().await.unwrap();
    wait_for(&mut run.events, &mut seen, |e| matches!(e, RunEvent::TaskCompleted { .. })).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(driver.submissions_for("B").is_empty(), "B started while paused");
    assert_eq!(handle.report().await.unwrap().status, RunStatus::Paused);

    handle.resume().await.unwrap();
    let report = running.await.unwrap().unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(driver.submissions_for("B").len(), 1);
}
