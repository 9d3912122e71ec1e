//! Scheduler: picks eligible tasks and claims pool slots for them.
//!
//! Eligibility is fixed (a `pending` task whose dependencies are all
//! `completed`); a `PriorityFn` only decides which eligible tasks go first
//! when there are fewer free slots than candidates.

use crate::clog_debug;
use crate::config::PriorityKind;
use crate::core::dag::TaskGraph;
use crate::core::task::{BlockReason, IsolationMode, TaskDefinition, TaskId};
use crate::error::Result;
use crate::orchestration::pool::AttemptPool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Orders eligible tasks. Must not filter: every id passed in comes back.
pub trait PriorityFn: Send + Sync {
    fn name(&self) -> &'static str;

    fn order(&self, graph: &TaskGraph, eligible: &mut Vec<TaskId>);
}

/// Compile order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fifo;

impl PriorityFn for Fifo {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn order(&self, graph: &TaskGraph, eligible: &mut Vec<TaskId>) {
        eligible.sort_by_key(|id| graph.get(id).map(|t| t.order).unwrap_or(usize::MAX));
    }
}

/// Longest chain of dependents first; compile order breaks ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct CriticalPathFirst;

impl PriorityFn for CriticalPathFirst {
    fn name(&self) -> &'static str {
        "critical_path"
    }

    fn order(&self, graph: &TaskGraph, eligible: &mut Vec<TaskId>) {
        let depths = graph.downstream_depths();
        eligible.sort_by_key(|id| {
            let depth = depths.get(id).copied().unwrap_or(0);
            let order = graph.get(id).map(|t| t.order).unwrap_or(usize::MAX);
            (std::cmp::Reverse(depth), order)
        });
    }
}

pub fn priority_for(kind: PriorityKind) -> Box<dyn PriorityFn> {
    match kind {
        PriorityKind::Fifo => Box::new(Fifo),
        PriorityKind::CriticalPath => Box::new(CriticalPathFirst),
    }
}

/// A task claimed for execution: already `in_progress`, slot reserved.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub attempt: u32,
    pub definition: TaskDefinition,
    pub isolation: IsolationMode,
    pub retry_context: Option<String>,
    pub cancel: CancellationToken,
}

pub struct Scheduler {
    graph: Arc<RwLock<TaskGraph>>,
    pool: AttemptPool,
    priority: Box<dyn PriorityFn>,
}

impl Scheduler {
    pub fn new(graph: Arc<RwLock<TaskGraph>>, max_concurrent: usize) -> Self {
        Self {
            graph,
            pool: AttemptPool::new(max_concurrent),
            priority: Box::new(Fifo),
        }
    }

    pub fn with_priority(mut self, priority: Box<dyn PriorityFn>) -> Self {
        self.priority = priority;
        self
    }

    pub fn priority_name(&self) -> &'static str {
        self.priority.name()
    }

    pub fn pool(&self) -> &AttemptPool {
        &self.pool
    }

    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    /// Eligible tasks, in priority order, that are not already in flight.
    pub async fn eligible(&self) -> Vec<TaskId> {
        let graph = self.graph.read().await;
        self.ordered_eligible(&graph)
    }

    fn ordered_eligible(&self, graph: &TaskGraph) -> Vec<TaskId> {
        let mut eligible: Vec<TaskId> = graph
            .eligible()
            .into_iter()
            .filter(|id| !self.pool.is_active(id))
            .collect();
        self.priority.order(graph, &mut eligible);
        eligible
    }

    /// Claim as many eligible tasks as there are free slots.
    ///
    /// Each claimed task moves `pending -> ready -> in_progress` under one
    /// write lock, so no other caller can claim it in between.
    pub async fn dispatch(&mut self) -> Result<Vec<Dispatch>> {
        let mut graph = self.graph.write().await;
        let candidates = self.ordered_eligible(&graph);
        let mut dispatched = Vec::new();

        for task_id in candidates {
            if !self.pool.has_capacity() {
                break;
            }
            let task = graph.task_mut(&task_id)?;
            task.mark_ready()?;
            let attempt = task.start_attempt()?;
            let cancel = self.pool.reserve(&task_id, attempt)?;
            clog_debug!(
                "Dispatching {} attempt {} ({} active)",
                task_id,
                attempt,
                self.pool.active_count()
            );
            dispatched.push(Dispatch {
                task_id: task_id.clone(),
                attempt,
                definition: task.definition.clone(),
                isolation: task.isolation_mode,
                retry_context: task.retry_context.clone(),
                cancel,
            });
        }

        Ok(dispatched)
    }

    /// Free the slot of a finished attempt.
    pub fn release(&mut self, task_id: &TaskId) -> Option<u32> {
        self.pool.release(task_id).map(|a| a.attempt)
    }

    /// Cancel the attempt in flight for `task_id`, if any.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        self.pool.cancel(task_id)
    }

    pub fn cancel_all(&self) {
        self.pool.cancel_all();
    }

    /// Block `task_id` and every pending transitive dependent.
    ///
    /// Returns the dependents that became blocked.
    pub async fn block_with_dependents(
        &mut self,
        task_id: &TaskId,
        reason: BlockReason,
    ) -> Result<Vec<TaskId>> {
        let mut graph = self.graph.write().await;
        graph.task_mut(task_id)?.block(reason)?;
        let blocked = graph.block_dependents(task_id)?;
        clog_debug!("Blocked {} and {} dependents", task_id, blocked.len());
        Ok(blocked)
    }
}
