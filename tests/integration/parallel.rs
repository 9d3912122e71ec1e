//! Parallel execution correctness tests.
//!
//! These tests verify that the scheduler respects the concurrency limit,
//! never starts a task before its dependencies complete, and orders ready
//! work by the configured priority.

use std::sync::Arc;
use std::time::Duration;

use conductor::config::PriorityKind;
use conductor::{Config, RunStatus};

use crate::fixtures::{
    assert_no_false_starts, collect_events, start_order, start_run, task, test_config,
    ScriptedAdvisor, ScriptedDriver, TestRepo,
};

/// Test: Concurrency limit is never exceeded
/// Given six independent tasks and a limit of 3
/// When the run executes
/// Then at most 3 agents are ever active, and the limit is reached
#[tokio::test]
async fn test_concurrency_limit_respected() {
    let repo = TestRepo::new();
    let driver = Arc::new(ScriptedDriver::new().with_delay(Duration::from_millis(250)));
    let defs = (1..=6).map(|i| task(&format!("T{}", i), &[])).collect();

    let run = start_run(&repo, test_config(3), defs, Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    let report = run.controller.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(driver.max_active(), 3);
    assert_eq!(driver.submissions().len(), 6);
}

/// Test: Limit of one serializes the run
/// Given three independent tasks and a limit of 1
/// When the run executes
/// Then no two agents overlap and tasks start in compile order
#[tokio::test]
async fn test_limit_of_one_serializes() {
    let repo = TestRepo::new();
    let driver = Arc::new(ScriptedDriver::new().with_delay(Duration::from_millis(100)));
    let defs = vec![task("A", &[]), task("B", &[]), task("C", &[])];

    let mut run = start_run(&repo, test_config(1), defs, Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    run.controller.run().await.unwrap();
    let events = collect_events(&mut run.events).await;

    assert_eq!(driver.max_active(), 1);
    assert_eq!(start_order(&events), vec!["A", "B", "C"]);
}

/// Test: Layered graph has no false starts
/// Given a three-layer graph with cross-layer edges
/// When it runs with a limit of 4
/// Then every task starts only after all of its dependencies completed
#[tokio::test]
async fn test_layered_graph_no_false_starts() {
    let repo = TestRepo::new();
    let driver = Arc::new(ScriptedDriver::new().with_delay(Duration::from_millis(80)));
    let deps: &[(&str, &[&str])] = &[
        ("core", &[]),
        ("util", &[]),
        ("lexer", &["core"]),
        ("parser", &["core", "lexer"]),
        ("printer", &["util"]),
        ("cli", &["parser", "printer", "util"]),
    ];
    let defs = deps.iter().map(|(id, d)| task(id, d)).collect();

    let mut run = start_run(&repo, test_config(4), defs, Arc::clone(&driver), Arc::new(ScriptedAdvisor::new())).await;
    let report = run.controller.run().await.unwrap();
    let events = collect_events(&mut run.events).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert!(driver.max_active() <= 4);
    assert_no_false_starts(&events, deps);
    assert_eq!(start_order(&events).last().map(String::as_str), Some("cli"));
}

fn priority_run_defs() -> Vec<conductor::TaskDefinition> {
    vec![
        task("A", &[]),
        task("B", &[]),
        task("C", &["B"]),
        task("D", &["C"]),
    ]
}

async fn order_with(priority: PriorityKind) -> Vec<String> {
    let repo = TestRepo::new();
    let config = Config {
        priority,
        ..test_config(1)
    };
    let mut run = start_run(
        &repo,
        config,
        priority_run_defs(),
        Arc::new(ScriptedDriver::new().with_delay(Duration::from_millis(20))),
        Arc::new(ScriptedAdvisor::new()),
    )
    .await;
    let report = run.controller.run().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    start_order(&collect_events(&mut run.events).await)
}

/// Test: FIFO priority follows compile order
/// Given A independent and a chain B -> C -> D, with a limit of 1
/// When FIFO priority is configured
/// Then A runs first
#[tokio::test]
async fn test_fifo_priority() {
    assert_eq!(order_with(PriorityKind::Fifo).await, vec!["A", "B", "C", "D"]);
}

/// Test: Critical path priority runs the long chain first
/// Given A independent and a chain B -> C -> D, with a limit of 1
/// When critical path priority is configured
/// Then the chain is started ahead of A wherever both are ready
#[tokio::test]
async fn test_critical_path_priority() {
    assert_eq!(order_with(PriorityKind::CriticalPath).await, vec!["B", "C", "A", "D"]);
}
