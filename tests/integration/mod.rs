//! Integration test suite for conductor.
//!
//! These tests run whole task graphs against real git repositories with a
//! scripted agent driver, and check that scheduling, verification, commits
//! and the escalation ladder work together.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Plan to completed run, commits and persisted reports
//! - `parallel`: Concurrency limits, dependency ordering and priority
//! - `recovery`: Retries, decomposition, review and human decisions
//!
//! # CI Compatibility
//!
//! No agent binaries are launched. Every attempt is played back by
//! `ScriptedDriver`, so the suite only needs `git` on the PATH.

mod fixtures;

mod parallel;
mod recovery;
mod workflow_e2e;
