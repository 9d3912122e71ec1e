//! Task graph (DAG) for dependency management.
//!
//! `TaskGraph` keeps tasks in a petgraph `StableDiGraph`, so node indices
//! survive insertions and removals: decomposition adds nodes mid-run while
//! in-flight lookups by `TaskId` stay valid. Edges point from a dependency
//! to its dependent.

use crate::core::task::{BlockReason, IsolationMode, Task, TaskDefinition, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// How a dependency edge came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    /// Declared in the plan.
    #[default]
    Declared,
    /// Added when a task was decomposed (inherited from, or redirected
    /// through, the parent).
    Inherited,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dependency::Declared => write!(f, "declared"),
            Dependency::Inherited => write!(f, "inherited"),
        }
    }
}

/// The dependency graph for one run.
#[derive(Clone)]
pub struct TaskGraph {
    graph: StableDiGraph<Task, Dependency>,
    task_index: HashMap<TaskId, NodeIndex>,
    /// Advisory layering; recomputed whenever the shape changes.
    layers: Vec<Vec<TaskId>>,
    run_isolation: IsolationMode,
    next_order: usize,
}

impl TaskGraph {
    /// Create an empty graph whose tasks default to `run_isolation`.
    pub fn new(run_isolation: IsolationMode) -> Self {
        Self {
            graph: StableDiGraph::new(),
            task_index: HashMap::new(),
            layers: Vec::new(),
            run_isolation,
            next_order: 0,
        }
    }

    pub fn run_isolation(&self) -> IsolationMode {
        self.run_isolation
    }

    /// Add a task node. Dependencies are wired separately.
    ///
    /// # Errors
    /// Returns an error if a task with the same id already exists.
    pub fn add_task(&mut self, definition: TaskDefinition) -> Result<NodeIndex> {
        if self.task_index.contains_key(&definition.id) {
            return Err(Error::Validation(format!(
                "Task {} already exists in graph",
                definition.id
            )));
        }
        let id = definition.id.clone();
        let task = Task::new(definition, self.run_isolation, self.next_order);
        self.next_order += 1;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Add an edge without any cycle check. The builder validates the
    /// whole graph once at the end.
    pub(crate) fn add_edge_unchecked(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        kind: Dependency,
    ) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;
        if self.graph.find_edge(from_index, to_index).is_none() {
            self.graph.add_edge(from_index, to_index, kind);
        }
        Ok(())
    }

    /// Add a dependency: `from` must complete before `to` can start.
    ///
    /// # Errors
    /// Returns an error if either task is missing or the edge would
    /// create a cycle (the edge is not kept in that case).
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId, kind: Dependency) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;
        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, kind);
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }

        if let Some(task) = self.graph.node_weight_mut(to_index) {
            if !task.definition.depends_on.contains(from) {
                task.definition.depends_on.push(from.clone());
            }
        }
        self.compute_layers();
        Ok(())
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.task_index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    /// Like `get_mut`, but a missing task is an error.
    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.get_mut(id).ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&f), Some(&t)) => self.graph.find_edge(f, t).is_some(),
            _ => false,
        }
    }

    pub fn dependency_kind(&self, from: &TaskId, to: &TaskId) -> Option<Dependency> {
        let f = self.task_index.get(from)?;
        let t = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*f, *t)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Direct dependencies of `id`, in compile order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, in compile order.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut tasks: Vec<&Task> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|n| self.graph.node_weight(n))
            .collect();
        tasks.sort_by_key(|t| t.order);
        tasks
    }

    /// Every task reachable through dependent edges, in compile order.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut tasks: Vec<&Task> = seen
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i))
            .collect();
        tasks.sort_by_key(|t| t.order);
        tasks.into_iter().map(|t| t.id().clone()).collect()
    }

    /// All tasks in compile order.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().collect();
        tasks.sort_by_key(|t| t.order);
        tasks
    }

    /// All task ids in compile order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks().into_iter().map(|t| t.id().clone()).collect()
    }

    // ========== Scheduling Queries ==========

    /// `pending` and every dependency `completed`.
    pub fn is_eligible(&self, id: &TaskId) -> bool {
        let Some(&index) = self.task_index.get(id) else {
            return false;
        };
        let Some(task) = self.graph.node_weight(index) else {
            return false;
        };
        task.status == TaskStatus::Pending && self.dependencies_completed(index)
    }

    fn dependencies_completed(&self, index: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .all(|dep| {
                self.graph
                    .node_weight(dep)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
    }

    /// Eligible tasks in compile order.
    pub fn eligible(&self) -> Vec<TaskId> {
        self.tasks()
            .into_iter()
            .filter(|t| self.is_eligible(t.id()))
            .map(|t| t.id().clone())
            .collect()
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.get(id).map(|t| t.status)
    }

    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.graph.node_weights().filter(|t| t.status == status).count()
    }

    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks()
            .into_iter()
            .filter(|t| t.status == status)
            .map(|t| t.id().clone())
            .collect()
    }

    /// Every task is completed or decomposed.
    pub fn all_settled(&self) -> bool {
        self.graph.node_weights().all(|t| t.status.is_settled())
    }

    /// Some task still has work ahead of it without human input.
    pub fn has_unfinished_work(&self) -> bool {
        self.graph.node_weights().any(|t| {
            matches!(
                t.status,
                TaskStatus::Pending
                    | TaskStatus::Ready
                    | TaskStatus::InProgress
                    | TaskStatus::Verifying
                    | TaskStatus::Failed
            )
        })
    }

    // ========== Blocking ==========

    /// Block every pending transitive dependent of `source`.
    ///
    /// Returns the ids that moved to `blocked`. Tasks outside the
    /// dependent closure are untouched.
    pub fn block_dependents(&mut self, source: &TaskId) -> Result<Vec<TaskId>> {
        let mut blocked = Vec::new();
        for id in self.transitive_dependents(source) {
            let task = self.task_mut(&id)?;
            if task.status == TaskStatus::Pending {
                task.block(BlockReason::Upstream {
                    task: source.clone(),
                })?;
                blocked.push(id);
            }
        }
        Ok(blocked)
    }

    /// Release upstream blocks whose cause is gone.
    ///
    /// Walks in topological order so chains clear in one pass. Returns the
    /// ids moved back to `pending`.
    pub fn release_upstream_blocks(&mut self) -> Result<Vec<TaskId>> {
        let order = toposort(&self.graph, None)
            .map_err(|_| Error::Validation("task graph contains a cycle".to_string()))?;
        let mut released = Vec::new();
        for index in order {
            let upstream_blocked = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .any(|dep| {
                    self.graph
                        .node_weight(dep)
                        .map(|t| t.status == TaskStatus::Blocked)
                        .unwrap_or(false)
                });
            let Some(task) = self.graph.node_weight_mut(index) else {
                continue;
            };
            if task.status == TaskStatus::Blocked
                && matches!(task.block_reason, Some(BlockReason::Upstream { .. }))
                && !upstream_blocked
            {
                task.reset_to_pending()?;
                released.push(task.id().clone());
            }
        }
        Ok(released)
    }

    // ========== Mutation at Runtime ==========

    /// Replace a failed task with `children`.
    ///
    /// Every child depends on (at least) the parent's dependencies; every
    /// dependent of the parent is rewired to depend on all children. The
    /// parent stays in the graph as `decomposed`. Children without an
    /// isolation override inherit the parent's effective mode.
    ///
    /// The graph is left untouched if validation fails.
    pub fn decompose(&mut self, parent: &TaskId, children: Vec<TaskDefinition>) -> Result<Vec<TaskId>> {
        let parent_task = self
            .get(parent)
            .ok_or_else(|| Error::TaskNotFound(parent.clone()))?;
        if parent_task.status != TaskStatus::Failed {
            return Err(Error::InvalidTransition {
                task: parent.clone(),
                from: parent_task.status.to_string(),
                to: TaskStatus::Decomposed.to_string(),
            });
        }
        if children.len() < 2 {
            return Err(Error::Validation(format!(
                "decomposition of {} needs at least two children, got {}",
                parent,
                children.len()
            )));
        }

        let parent_deps: Vec<TaskId> = parent_task.depends_on().to_vec();
        let parent_isolation = parent_task.isolation_mode;
        let child_ids: Vec<TaskId> = children.iter().map(|c| c.id.clone()).collect();

        let mut seen = HashSet::new();
        for child in &children {
            if child.id.is_empty() {
                return Err(Error::Validation(format!("child of {} has an empty id", parent)));
            }
            if self.contains(&child.id) || !seen.insert(child.id.clone()) {
                return Err(Error::Validation(format!("duplicate task id: {}", child.id)));
            }
            if child.verification.is_empty() {
                return Err(Error::Validation(format!(
                    "child {} declares no verification checks",
                    child.id
                )));
            }
            for dep in &child.depends_on {
                if !self.contains(dep) && !child_ids.contains(dep) {
                    return Err(Error::Validation(format!(
                        "child {} depends on unknown task {}",
                        child.id, dep
                    )));
                }
                if dep == parent {
                    return Err(Error::Validation(format!(
                        "child {} cannot depend on its parent {}",
                        child.id, parent
                    )));
                }
            }
        }

        let mut next = self.clone();
        for mut child in children {
            for dep in &parent_deps {
                if !child.depends_on.contains(dep) {
                    child.depends_on.push(dep.clone());
                }
            }
            if child.isolation.is_none() {
                child.isolation = Some(parent_isolation);
            }
            let id = child.id.clone();
            next.add_task(child)?;
            next.task_mut(&id)?.decomposed_from = Some(parent.clone());
        }
        for child_id in &child_ids {
            let deps = next.index_of(child_id).map(|i| next.graph[i].depends_on().to_vec())?;
            for dep in deps {
                let kind = if parent_deps.contains(&dep) {
                    Dependency::Inherited
                } else {
                    Dependency::Declared
                };
                next.add_edge_unchecked(&dep, child_id, kind)?;
            }
        }

        let parent_index = next.index_of(parent)?;
        let outgoing: Vec<_> = next
            .graph
            .edges_directed(parent_index, Direction::Outgoing)
            .map(|e| (e.id(), e.target()))
            .collect();
        for (edge, target) in outgoing {
            next.graph.remove_edge(edge);
            let dependent = next.graph[target].id().clone();
            for child_id in &child_ids {
                next.add_edge_unchecked(child_id, &dependent, Dependency::Inherited)?;
            }
            let deps = &mut next.graph[target].definition.depends_on;
            deps.retain(|d| d != parent);
            for child_id in &child_ids {
                if !deps.contains(child_id) {
                    deps.push(child_id.clone());
                }
            }
        }

        if is_cyclic_directed(&next.graph) {
            return Err(Error::Validation(format!(
                "decomposition of {} would create a cycle",
                parent
            )));
        }

        next.task_mut(parent)?.mark_decomposed(child_ids.clone())?;
        next.compute_layers();
        *self = next;
        Ok(child_ids)
    }

    /// Swap a task's definition (human "replace" decision) and rewire its
    /// incoming edges to the new `depends_on`.
    ///
    /// The task keeps its id, compile order and attempt history.
    pub fn replace_definition(&mut self, definition: TaskDefinition) -> Result<()> {
        let id = definition.id.clone();
        let index = self.index_of(&id)?;
        if definition.verification.is_empty() {
            return Err(Error::Validation(format!(
                "replacement for {} declares no verification checks",
                id
            )));
        }
        for dep in &definition.depends_on {
            if !self.contains(dep) {
                return Err(Error::Validation(format!(
                    "replacement for {} depends on unknown task {}",
                    id, dep
                )));
            }
        }

        let mut next = self.clone();
        let incoming: Vec<_> = next
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|e| e.id())
            .collect();
        for edge in incoming {
            next.graph.remove_edge(edge);
        }
        for dep in &definition.depends_on {
            next.add_edge_unchecked(dep, &id, Dependency::Declared)?;
        }
        if is_cyclic_directed(&next.graph) {
            return Err(Error::Validation(format!(
                "replacement for {} would create a cycle",
                id
            )));
        }
        let task = &mut next.graph[index];
        task.isolation_mode = definition.isolation.unwrap_or(next.run_isolation);
        task.definition = definition;
        next.compute_layers();
        *self = next;
        Ok(())
    }

    // ========== Layering ==========

    /// Recompute the advisory layering: layer 0 holds tasks without
    /// dependencies; a task's layer is one more than its deepest dependency.
    pub fn compute_layers(&mut self) {
        let Ok(order) = toposort(&self.graph, None) else {
            self.layers.clear();
            return;
        };
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for index in &order {
            let d = self
                .graph
                .neighbors_directed(*index, Direction::Incoming)
                .filter_map(|dep| depth.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*index, d);
        }
        let max_depth = depth.values().copied().max().map(|d| d + 1).unwrap_or(0);
        let mut layers: Vec<Vec<&Task>> = vec![Vec::new(); max_depth];
        for (index, d) in &depth {
            if let Some(task) = self.graph.node_weight(*index) {
                layers[*d].push(task);
            }
        }
        self.layers = layers
            .into_iter()
            .map(|mut layer| {
                layer.sort_by_key(|t| t.order);
                layer.into_iter().map(|t| t.id().clone()).collect()
            })
            .collect();
    }

    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.layers.iter().position(|layer| layer.contains(id))
    }

    /// Length of the longest dependent chain starting at each task
    /// (a sink has length 1).
    pub fn downstream_depths(&self) -> HashMap<TaskId, usize> {
        let mut result: HashMap<NodeIndex, usize> = HashMap::new();
        if let Ok(order) = toposort(&self.graph, None) {
            for index in order.into_iter().rev() {
                let d = self
                    .graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .filter_map(|n| result.get(&n))
                    .max()
                    .copied()
                    .unwrap_or(0)
                    + 1;
                result.insert(index, d);
            }
        }
        result
            .into_iter()
            .filter_map(|(i, d)| self.graph.node_weight(i).map(|t| (t.id().clone(), d)))
            .collect()
    }

    /// Tasks in an order where every task follows its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("Cycle detected at task: {}", name))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    pub(crate) fn inner(&self) -> &StableDiGraph<Task, Dependency> {
        &self.graph
    }

    pub(crate) fn node_index(&self, id: &TaskId) -> Option<NodeIndex> {
        self.task_index.get(id).copied()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new(IsolationMode::default())
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .field("layers", &self.layers.len())
            .finish()
    }
}
