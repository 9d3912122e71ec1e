//! Failure handling and recovery integration tests.
//!
//! These tests walk failed tasks up the escalation ladder (retry,
//! decomposition, peer review, human) and check that only the failing
//! task and its dependents are held back.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::{BlockReason, EventKind, IsolationMode, Rung, TaskDefinition};
use conductor::orchestration::{RecoveryDecision, RetryContext};
use conductor::{Config, Error, HumanDecision, RunEvent, RunStatus, TaskStatus};

use crate::fixtures::{
    assert_no_false_starts, collect_events, id, start_run, task, test_config, wait_for,
    ScriptedAdvisor, ScriptedDriver, Step, TestRepo,
};

fn paused(e: &RunEvent) -> bool {
    matches!(e, RunEvent::StatusChanged { status: RunStatus::Paused })
}

fn error_messages(report: &conductor::RunReport, task_id: &str) -> Vec<String> {
    report
        .task(&id(task_id))
        .map(|t| {
            t.attempt_logs
                .iter()
                .flat_map(|log| log.events())
                .filter_map(|e| match &e.kind {
                    EventKind::Error { message } => Some(message.clone()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

// ========== Retry Tests ==========

/// Test: Retries are bounded
/// Given A that always crashes, B depending on A and independent C
/// When the ladder has two retries and no advisor rungs
/// Then A is attempted exactly three times and blocked, B is blocked
/// behind it, C completes, and the run pauses
#[tokio::test]
async fn test_retries_are_bounded() {
    let repo = TestRepo::new();
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Exit(1), Step::Exit(1), Step::Exit(1), Step::Exit(1)]));
    let defs = vec![task("A", &[]), task("B", &["A"]), task("C", &[])];

    let mut run = start_run(&repo, test_config(2), defs, Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    drop(run.handle);
    let report = run.controller.run().await.unwrap();
    let events = collect_events(&mut run.events).await;

    assert_eq!(report.status, RunStatus::Paused);
    assert_eq!(driver.submissions_for("A").len(), 3);
    let a = report.task(&id("A")).unwrap();
    assert_eq!(a.status, TaskStatus::Blocked);
    assert_eq!(a.attempts, 3);
    assert!(matches!(a.block_reason, Some(BlockReason::Escalated { .. })));
    assert_eq!(report.task(&id("B")).unwrap().block_reason, Some(BlockReason::Upstream { task: id("A") }));
    assert_eq!(report.task(&id("C")).unwrap().status, TaskStatus::Completed);
    assert!(driver.submissions_for("B").is_empty());

    let rungs: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Escalated { task_id, rung, .. } if task_id == &id("A") => Some(*rung),
            _ => None,
        })
        .collect();
    assert_eq!(rungs, vec![Rung::Retry, Rung::Retry, Rung::Human]);

    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].task_id, id("A"));
}

/// Test: Retry carries the failure forward
/// Given A whose first attempt exits without producing its output
/// When A is retried
/// Then the second attempt sees the failing check and passes
#[tokio::test]
async fn test_retry_carries_failure_context() {
    let repo = TestRepo::new();
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Idle]));

    let run = start_run(&repo, test_config(1), vec![task("A", &[])], Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    let report = run.controller.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let subs = driver.submissions_for("A");
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[0].prior_failure, None);
    let notes = subs[1].prior_failure.clone().unwrap();
    assert!(notes.contains("test -f out/A.txt"), "notes were: {}", notes);
    assert!(subs[1].prompt.contains("test -f out/A.txt"));

    let a = report.task(&id("A")).unwrap();
    assert_eq!(a.attempts, 2);
    assert_eq!(a.attempt_logs.len(), 2);
    assert!(a.attempt_logs[0]
        .events()
        .iter()
        .any(|e| e.kind == EventKind::Check { name: "test -f out/A.txt".to_string(), passed: false }));
}

// ========== Decomposition Tests ==========

/// Test: Decomposition replaces a failed task
/// Given A that fails and an advisor that splits it into A1 -> A2
/// When the ladder reaches decomposition
/// Then A is decomposed, the children run, and B (downstream of A) waits
/// for both children
#[tokio::test]
async fn test_retry_then_decompose() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 1,
        decompose: true,
        ..test_config(2)
    };
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Idle, Step::Exit(2)]));
    let advisor = Arc::new(ScriptedAdvisor::new().decompose_into(vec![task("A1", &[]), task("A2", &["A1"])]));
    let defs = vec![task("A", &[]), task("B", &["A"])];

    let mut run = start_run(&repo, config, defs, Arc::clone(&driver), Arc::clone(&advisor)).await;
    let report = run.controller.run().await.unwrap();
    let events = collect_events(&mut run.events).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(driver.submissions_for("A").len(), 2);
    assert_eq!(advisor.calls(), vec![("decompose", id("A"))]);

    let a = report.task(&id("A")).unwrap();
    assert_eq!(a.status, TaskStatus::Decomposed);
    assert_eq!(a.replaced_by, vec![id("A1"), id("A2")]);
    assert_eq!(report.task(&id("A1")).unwrap().decomposed_from, Some(id("A")));
    assert_eq!(report.task(&id("B")).unwrap().status, TaskStatus::Completed);

    assert!(events.contains(&RunEvent::TaskDecomposed {
        task_id: id("A"),
        children: vec![id("A1"), id("A2")],
    }));
    assert_no_false_starts(&events, &[("A2", &["A1"][..]), ("B", &["A1", "A2"][..])]);
    assert!(repo.file_at(&report.branch, "out/A2.txt").is_some());
}

/// Test: Unusable decomposition blocks only the failing subtree
/// Given A that fails, B depending on A, independent C, and an advisor
/// proposing a single child
/// When the decomposition is rejected
/// Then an error event records why, A and B are blocked, and C completes
#[tokio::test]
async fn test_unusable_decomposition_escalates() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 0,
        decompose: true,
        ..test_config(2)
    };
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Exit(1)]));
    let advisor = Arc::new(ScriptedAdvisor::new().decompose_into(vec![task("A1", &[])]));
    let defs = vec![task("A", &[]), task("B", &["A"]), task("C", &[])];

    let run = start_run(&repo, config, defs, Arc::clone(&driver), Arc::clone(&advisor)).await;
    drop(run.handle);
    let report = run.controller.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Paused);
    assert_eq!(advisor.calls().len(), 1);
    assert!(report.task(&id("A1")).is_none());
    assert_eq!(report.task(&id("A")).unwrap().status, TaskStatus::Blocked);
    assert_eq!(report.task(&id("B")).unwrap().status, TaskStatus::Blocked);
    assert_eq!(report.task(&id("C")).unwrap().status, TaskStatus::Completed);

    let errors = error_messages(&report, "A");
    assert!(
        errors.iter().any(|m| m.contains("advice unusable") && m.contains("at least two children")),
        "errors were: {:?}",
        errors
    );
}

// ========== Peer Review Tests ==========

/// Test: Peer review guides the next attempt
/// Given A that fails once and a reviewer that answers with notes
/// When the ladder reaches peer review
/// Then A is retried with the reviewer's notes and completes
#[tokio::test]
async fn test_peer_review_retry() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 0,
        peer_review: true,
        max_peer_reviews: 1,
        ..test_config(1)
    };
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Idle]));
    let advisor = Arc::new(
        ScriptedAdvisor::new().review(RecoveryDecision::Retry(RetryContext::notes("create out/A.txt before exiting"))),
    );

    let run = start_run(&repo, config, vec![task("A", &[])], Arc::clone(&driver), Arc::clone(&advisor)).await;
    let report = run.controller.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(advisor.calls(), vec![("review", id("A"))]);
    let subs = driver.submissions_for("A");
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[1].prior_failure.as_deref(), Some("create out/A.txt before exiting"));
}

/// Test: Reviewer escalation goes to a human
/// Given A that fails and a reviewer that escalates
/// When the ladder reaches peer review
/// Then A is blocked with no further attempts
#[tokio::test]
async fn test_peer_review_escalation_blocks() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 0,
        peer_review: true,
        ..test_config(1)
    };
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Exit(1)]));
    let advisor = Arc::new(ScriptedAdvisor::new().review(RecoveryDecision::Escalate {
        reason: "contract is ambiguous".to_string(),
    }));

    let run = start_run(&repo, config, vec![task("A", &[])], Arc::clone(&driver), Arc::clone(&advisor)).await;
    drop(run.handle);
    let report = run.controller.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Paused);
    assert_eq!(driver.submissions_for("A").len(), 1);
    assert_eq!(report.blocked[0].peer_review.as_deref(), Some("contract is ambiguous"));
}

// ========== Human Decision Tests ==========

/// Test: Human retry resumes the run
/// Given A blocked after its ladder ran out and B waiting behind it
/// When the operator decides to retry A with notes
/// Then A and B are released and the run completes
#[tokio::test]
async fn test_human_retry_resumes_run() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 0,
        ..test_config(2)
    };
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Idle]));
    let mut run = start_run(&repo, config, vec![task("A", &[]), task("B", &["A"])], Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    let handle = run.handle.clone();
    let running = tokio::spawn(run.controller.run());

    let mut seen = Vec::new();
    wait_for(&mut run.events, &mut seen, paused).await;
    let blocked = handle.blocked().await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].task_id, id("A"));

    handle
        .resolve(&id("A"), HumanDecision::Retry {
            notes: Some("write the file this time".to_string()),
        })
        .await
        .unwrap();
    let report = running.await.unwrap().unwrap();
    seen.extend(collect_events(&mut run.events).await);

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        driver.submissions_for("A")[1].prior_failure.as_deref(),
        Some("write the file this time")
    );
    assert!(seen.contains(&RunEvent::TaskReleased { task_id: id("B") }));
    assert!(report.blocked.is_empty());
}

/// Test: A human retry grants a fresh attempt budget
/// Given A that fails until its fourth attempt and a ladder of one retry
/// When the operator retries A after the ladder runs out
/// Then A climbs the retry rung again and completes on attempt four
#[tokio::test]
async fn test_human_retry_starts_new_cycle() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 1,
        ..test_config(1)
    };
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Exit(1), Step::Exit(1), Step::Exit(1)]));
    let mut run = start_run(&repo, config, vec![task("A", &[])], Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    let handle = run.handle.clone();
    let running = tokio::spawn(run.controller.run());

    let mut seen = Vec::new();
    wait_for(&mut run.events, &mut seen, paused).await;
    assert_eq!(driver.submissions_for("A").len(), 2);
    handle.resolve(&id("A"), HumanDecision::Retry { notes: None }).await.unwrap();
    let report = running.await.unwrap().unwrap();
    seen.extend(collect_events(&mut run.events).await);

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(driver.submissions_for("A").len(), 4);
    assert_eq!(report.task(&id("A")).unwrap().attempts, 4);

    let rungs: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            RunEvent::Escalated { rung, detail, .. } => Some((*rung, detail.starts_with("human decision"))),
            _ => None,
        })
        .collect();
    assert_eq!(
        rungs.iter().map(|(rung, _)| *rung).collect::<Vec<_>>(),
        vec![Rung::Retry, Rung::Human, Rung::Human, Rung::Retry]
    );
    assert!(rungs[2].1, "third step should be the operator's decision");
}

/// Test: Human replacement runs the new definition
/// Given A blocked because its check can never pass
/// When the operator replaces its definition
/// Then the next attempt runs the new definition and completes
#[tokio::test]
async fn test_human_replace_definition() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 0,
        ..test_config(1)
    };
    let broken = TaskDefinition::new("A", "A task").with_check("false");
    let driver = Arc::new(ScriptedDriver::new());
    let mut run = start_run(&repo, config, vec![broken], Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    let handle = run.handle.clone();
    let running = tokio::spawn(run.controller.run());

    let mut seen = Vec::new();
    wait_for(&mut run.events, &mut seen, paused).await;
    let revised = TaskDefinition::new("ignored", "A revised")
        .with_contract("write out/A.txt")
        .with_output("out/A.txt")
        .with_check("test -f out/A.txt");
    handle
        .resolve(&id("A"), HumanDecision::Replace { definition: revised })
        .await
        .unwrap();
    let report = running.await.unwrap().unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let a = report.task(&id("A")).unwrap();
    assert_eq!(a.title, "A revised");
    assert_eq!(a.attempts, 2);
    assert!(driver.submissions_for("A")[1].prompt.contains("write out/A.txt"));
}

/// Test: Decisions need a blocked task
/// Given a run paused on A with C completed
/// When the operator resolves C or an unknown task
/// Then both are rejected and nothing changes
#[tokio::test]
async fn test_resolve_rejects_unblocked_task() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 0,
        ..test_config(2)
    };
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Exit(1)]));
    let mut run = start_run(&repo, config, vec![task("A", &[]), task("C", &[])], driver, Arc::new(ScriptedAdvisor::new())).await;
    let handle = run.handle.clone();
    let running = tokio::spawn(run.controller.run());

    let mut seen = Vec::new();
    wait_for(&mut run.events, &mut seen, paused).await;
    let retry = HumanDecision::Retry { notes: None };
    assert!(matches!(
        handle.resolve(&id("C"), retry.clone()).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        handle.resolve(&id("missing"), retry).await,
        Err(Error::TaskNotFound(_))
    ));

    drop(handle);
    drop(run.handle);
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Paused);
    assert_eq!(report.task(&id("C")).unwrap().status, TaskStatus::Completed);
}

/// Test: Abandon keeps the branch
/// Given a run with one hanging agent and a blocked task
/// When the operator abandons the run
/// Then the agent is stopped, the run is aborted, and the branch remains
#[tokio::test]
async fn test_abandon_keeps_branch() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 0,
        ..test_config(2)
    };
    let driver = Arc::new(ScriptedDriver::new().script("A", [Step::Exit(1)]).script("H", [Step::Hang]));
    let mut run = start_run(&repo, config, vec![task("A", &[]), task("H", &[])], Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    let branch = run.session.branch.clone();
    let handle = run.handle.clone();
    let running = tokio::spawn(run.controller.run());

    let mut seen = Vec::new();
    wait_for(&mut run.events, &mut seen, |e| matches!(e, RunEvent::TaskBlocked { .. })).await;
    handle.resolve(&id("A"), HumanDecision::Abandon).await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(15), running)
        .await
        .expect("abandoned run did not finish")
        .unwrap()
        .unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.task(&id("H")).unwrap().block_reason, Some(BlockReason::Cancelled));
    assert!(repo.branch_exists(&branch));
    assert_eq!(repo.store().load(&report.run_id).unwrap().status, RunStatus::Aborted);
    assert!(handle.pause().await.is_err());
}

// ========== Cancellation Tests ==========

/// Test: Cancelling settles only what is still running
/// Given A that completes and H that hangs
/// When the operator cancels A, an unknown task, and H
/// Then A is untouched, the unknown id is an error, and H is blocked as
/// cancelled
#[tokio::test]
async fn test_cancel_task() {
    let repo = TestRepo::new();
    let driver = Arc::new(ScriptedDriver::new().script("H", [Step::Hang]));
    let mut run = start_run(&repo, test_config(2), vec![task("A", &[]), task("H", &[])], driver, Arc::new(ScriptedAdvisor::new())).await;
    let handle = run.handle.clone();
    let running = tokio::spawn(run.controller.run());

    let mut seen = Vec::new();
    wait_for(&mut run.events, &mut seen, |e| {
        matches!(e, RunEvent::TaskCompleted { task_id, .. } if task_id.as_str() == "A")
    })
    .await;
    let before = handle.report().await.unwrap();
    assert!(!handle.cancel_task(&id("A")).await.unwrap());
    assert!(matches!(handle.cancel_task(&id("nope")).await, Err(Error::TaskNotFound(_))));
    let after = handle.report().await.unwrap();
    assert_eq!(before.events().count(), after.events().count(), "no-op cancel recorded events");

    assert!(handle.cancel_task(&id("H")).await.unwrap());
    assert!(!handle.cancel_task(&id("H")).await.unwrap());
    wait_for(&mut run.events, &mut seen, paused).await;

    drop(handle);
    drop(run.handle);
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Paused);
    assert_eq!(report.task(&id("A")).unwrap().status, TaskStatus::Completed);
    assert_eq!(report.task(&id("H")).unwrap().block_reason, Some(BlockReason::Cancelled));
}

/// Test: Attempts never commit each other's files
/// Given A with no declared outputs and H that leaves a half-written
/// scratch file before hanging
/// When A completes while H is still running, then H is cancelled
/// Then the run branch holds A's output but not H's scratch file, and
/// H's attempt records no commit
#[tokio::test]
async fn test_attempt_commits_are_isolated() {
    let repo = TestRepo::new();
    let undeclared = TaskDefinition::new("A", "A task")
        .with_contract("write out/A.txt")
        .with_check("test -f out/A.txt");
    let driver = Arc::new(ScriptedDriver::new().script("H", [Step::Hang]));
    let mut run = start_run(&repo, test_config(2), vec![undeclared, task("H", &[])], driver, Arc::new(ScriptedAdvisor::new())).await;
    let branch = run.session.branch.clone();
    let handle = run.handle.clone();
    let running = tokio::spawn(run.controller.run());

    let mut seen = Vec::new();
    wait_for(&mut run.events, &mut seen, |e| {
        matches!(e, RunEvent::TaskCompleted { task_id, .. } if task_id.as_str() == "A")
    })
    .await;
    assert!(repo.file_at(&branch, "out/A.txt").is_some());
    assert!(repo.file_at(&branch, "scratch/H.wip").is_none());

    assert!(handle.cancel_task(&id("H")).await.unwrap());
    wait_for(&mut run.events, &mut seen, paused).await;
    drop(handle);
    drop(run.handle);
    let report = running.await.unwrap().unwrap();

    assert!(repo.file_at(&branch, "scratch/H.wip").is_none());
    let h = report.task(&id("H")).unwrap();
    assert!(h
        .attempt_logs
        .iter()
        .flat_map(|log| log.events())
        .all(|e| !matches!(e.kind, EventKind::Commit { .. })));
    let a = report.task(&id("A")).unwrap();
    assert!(a
        .attempt_logs
        .iter()
        .flat_map(|log| log.events())
        .all(|e| !matches!(&e.kind, EventKind::FileChanged { path, .. } if path.starts_with("scratch"))));
}

// ========== Execution Error Tests ==========

/// Test: Agent errors are events, not run failures
/// Given a container-isolated task that crashes and a task whose agent
/// cannot be launched, next to a healthy task
/// When the run executes
/// Then each error lands in its task's log and the healthy task completes
#[tokio::test]
async fn test_execution_errors_are_recorded() {
    let repo = TestRepo::new();
    let config = Config {
        max_retries: 0,
        ..test_config(3)
    };
    let driver = Arc::new(
        ScriptedDriver::new()
            .script("boxed", [Step::Exit(137)])
            .script("missing", [Step::Refuse]),
    );
    let defs = vec![
        task("boxed", &[]).with_isolation(IsolationMode::Container),
        task("missing", &[]),
        task("ok", &[]),
    ];

    let run = start_run(&repo, config, defs, Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    drop(run.handle);
    let report = run.controller.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Paused);
    assert_eq!(driver.submissions_for("boxed")[0].isolation, IsolationMode::Container);
    assert_eq!(report.task(&id("boxed")).unwrap().isolation, IsolationMode::Container);
    assert_eq!(driver.submissions_for("ok")[0].isolation, IsolationMode::Direct);

    assert!(error_messages(&report, "boxed")
        .iter()
        .any(|m| m == "agent exited with status 137"));
    assert!(error_messages(&report, "missing")
        .iter()
        .any(|m| m.contains("agent binary missing")));
    assert_eq!(report.task(&id("ok")).unwrap().status, TaskStatus::Completed);
}
