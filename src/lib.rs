pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod plan;
pub mod session;
pub mod util;

pub use config::Config;
pub use crate::core::{GraphBuilder, TaskDefinition, TaskGraph, TaskId, TaskStatus};
pub use error::{BuildError, Error, ExecutionError, Result};
pub use orchestration::{HumanDecision, RunController, RunEvent, RunHandle};
pub use session::{RunId, RunReport, RunSession, RunStatus, RunStore};
