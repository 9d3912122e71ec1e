//! Attempt pool: the concurrency limit.
//!
//! The `AttemptPool` tracks every attempt in flight, enforces the
//! `max_concurrent` limit and owns each attempt's cancellation token.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// One attempt holding a pool slot.
#[derive(Debug, Clone)]
pub struct ActiveAttempt {
    pub task_id: TaskId,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Bounded set of in-flight attempts, at most one per task.
///
/// # Example
///
/// ```ignore
/// let mut pool = AttemptPool::new(2);
/// let token = pool.reserve(&TaskId::from("T-001"), 1)?;
/// assert_eq!(pool.active_count(), 1);
/// pool.cancel(&TaskId::from("T-001"));
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug)]
pub struct AttemptPool {
    attempts: HashMap<TaskId, ActiveAttempt>,
    max_concurrent: usize,
}

impl AttemptPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            attempts: HashMap::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Take a slot for `task_id`'s attempt and hand back its cancellation
    /// token.
    ///
    /// # Errors
    ///
    /// `PoolFull` at capacity; `Validation` if the task already has an
    /// attempt in flight.
    pub fn reserve(&mut self, task_id: &TaskId, attempt: u32) -> Result<CancellationToken> {
        if self.attempts.contains_key(task_id) {
            return Err(Error::Validation(format!(
                "task {} already has an attempt in flight",
                task_id
            )));
        }
        if !self.has_capacity() {
            return Err(Error::PoolFull {
                max: self.max_concurrent,
            });
        }
        let cancel = CancellationToken::new();
        self.attempts.insert(
            task_id.clone(),
            ActiveAttempt {
                task_id: task_id.clone(),
                attempt,
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    /// Free the slot held by `task_id`.
    pub fn release(&mut self, task_id: &TaskId) -> Option<ActiveAttempt> {
        self.attempts.remove(task_id)
    }

    /// Request cancellation of `task_id`'s attempt. The slot stays taken
    /// until the attempt reports back.
    ///
    /// Returns `false` when nothing is in flight for the task. Calling this
    /// repeatedly is harmless.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        match self.attempts.get(task_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for active in self.attempts.values() {
            active.cancel.cancel();
        }
    }

    pub fn is_active(&self, task_id: &TaskId) -> bool {
        self.attempts.contains_key(task_id)
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.attempts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
