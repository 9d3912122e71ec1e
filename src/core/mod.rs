//! Core domain models for the execution engine.
//!
//! Tasks, the dependency graph they live in, and the events recorded while
//! they run.

pub mod builder;
pub mod dag;
pub mod event;
pub mod task;

pub use builder::GraphBuilder;
pub use dag::{Dependency, TaskGraph};
pub use event::{AttemptLog, EventKind, ExecutionEvent, FileChange, OutputStream, Rung};
pub use task::{
    BlockReason, Complexity, IsolationMode, Task, TaskDefinition, TaskId, TaskStatus,
    VerificationCheck,
};
