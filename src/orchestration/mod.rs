//! Orchestration layer: everything that turns a task graph into executed,
//! verified work.
//!
//! The scheduler claims eligible tasks, a driver runs the agent, the monitor
//! records what happens, the verifier judges it and the failure handler
//! decides what to do when it goes wrong. The controller ties these together
//! for one run.

pub mod advisor;
pub mod context;
pub mod controller;
pub mod driver;
pub mod failure;
pub mod monitor;
pub mod pool;
pub mod scheduler;
pub mod verifier;

pub use advisor::{
    CommandAdvisor, EscalatingAdvisor, FailureReport, RecoveryAdvisor, RecoveryDecision, RetryContext,
};
pub use context::{TaskContext, DONE_MARKER};
pub use controller::{HumanDecision, RunController, RunEvent, RunHandle};
pub use driver::{
    CommandDriver, ExecutionDriver, ExecutionHandle, ExecutionRequest, ExitStatus, OutputChunk,
};
pub use failure::{BlockedSummary, FailureCause, FailureHandler, LadderPolicy, LadderState};
pub use monitor::{Monitor, MonitorConfig, MonitorOutcome};
pub use pool::{ActiveAttempt, AttemptPool};
pub use scheduler::{CriticalPathFirst, Dispatch, Fifo, PriorityFn, Scheduler};
pub use verifier::{Verdict, Verifier};
