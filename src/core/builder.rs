//! Compile task definitions into a validated `TaskGraph`.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::stable_graph::NodeIndex;
use petgraph::Direction;

use crate::clog_debug;
use crate::core::dag::{Dependency, TaskGraph};
use crate::core::task::{IsolationMode, TaskDefinition, TaskId};
use crate::error::BuildError;

/// Validates definitions and produces the run's graph.
///
/// Checks run in a fixed order: empty ids, duplicate ids, missing
/// verification, dangling references, then cycles. The first failure wins.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    run_isolation: IsolationMode,
}

impl GraphBuilder {
    pub fn new(run_isolation: IsolationMode) -> Self {
        Self { run_isolation }
    }

    pub fn build<I>(&self, definitions: I) -> Result<TaskGraph, BuildError>
    where
        I: IntoIterator<Item = TaskDefinition>,
    {
        let definitions: Vec<TaskDefinition> = definitions.into_iter().collect();

        let mut ids = HashSet::new();
        for (position, def) in definitions.iter().enumerate() {
            if def.id.is_empty() {
                return Err(BuildError::EmptyId(position));
            }
            if !ids.insert(def.id.clone()) {
                return Err(BuildError::DuplicateId(def.id.clone()));
            }
        }
        for def in &definitions {
            if def.verification.is_empty() {
                return Err(BuildError::NoVerification(def.id.clone()));
            }
            if let Some(missing) = def.depends_on.iter().find(|d| !ids.contains(*d)) {
                return Err(BuildError::DanglingReference {
                    task: def.id.clone(),
                    missing: missing.clone(),
                });
            }
        }

        let mut graph = TaskGraph::new(self.run_isolation);
        let edges: Vec<(TaskId, TaskId)> = definitions
            .iter()
            .flat_map(|def| {
                def.depends_on
                    .iter()
                    .map(move |dep| (dep.clone(), def.id.clone()))
            })
            .collect();
        for def in definitions {
            let id = def.id.clone();
            graph.add_task(def).map_err(|_| BuildError::DuplicateId(id))?;
        }
        for (from, to) in &edges {
            graph
                .add_edge_unchecked(from, to, Dependency::Declared)
                .map_err(|_| BuildError::DanglingReference {
                    task: to.clone(),
                    missing: from.clone(),
                })?;
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(BuildError::Cycle(cycle));
        }

        graph.compute_layers();
        clog_debug!(
            "Built task graph: {} tasks, {} dependencies, {} layers",
            graph.len(),
            graph.dependency_count(),
            graph.layers().len()
        );
        Ok(graph)
    }
}

/// Find one concrete cycle, returned as a closed path (`A -> B -> A`).
///
/// Picks the strongly connected component containing the earliest task in
/// compile order, so the reported cycle is deterministic.
fn find_cycle(graph: &TaskGraph) -> Option<Vec<TaskId>> {
    let inner = graph.inner();
    let order_of = |i: NodeIndex| inner.node_weight(i).map(|t| t.order).unwrap_or(usize::MAX);

    let cyclic = tarjan_scc(inner)
        .into_iter()
        .filter(|scc| scc.len() > 1 || inner.find_edge(scc[0], scc[0]).is_some())
        .min_by_key(|scc| scc.iter().map(|&i| order_of(i)).min().unwrap_or(usize::MAX))?;

    let start = cyclic.iter().copied().min_by_key(|&i| order_of(i))?;
    let members: HashSet<NodeIndex> = cyclic.iter().copied().collect();

    if inner.find_edge(start, start).is_some() {
        let id = inner.node_weight(start)?.id().clone();
        return Some(vec![id.clone(), id]);
    }

    // BFS inside the component from `start` back to `start`.
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    let mut closing = None;
    'search: while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = inner
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by_key(|&n| order_of(n));
        for n in next {
            if n == start {
                closing = Some(node);
                break 'search;
            }
            if let std::collections::hash_map::Entry::Vacant(e) = parent.entry(n) {
                e.insert(node);
                queue.push_back(n);
            }
        }
    }

    let mut path = vec![start];
    let mut cursor = closing?;
    let mut tail = Vec::new();
    while cursor != start {
        tail.push(cursor);
        cursor = *parent.get(&cursor)?;
    }
    tail.reverse();
    path.extend(tail);
    path.push(start);

    path.into_iter()
        .map(|i| inner.node_weight(i).map(|t| t.id().clone()))
        .collect()
}
