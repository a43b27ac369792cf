//! Task-type dependency graph.
//!
//! `DependencyResolver` holds the static graph of task types (an edge
//! `A -> B` means tasks of type B need type A resolved first), computes the
//! execution waves used for planning, and decides whether a pending task is
//! ready, still blocked, or must be skipped.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::task::{SkipReason, TaskId, TaskType};
use crate::error::{Error, Result};

/// One planning wave: task types whose dependencies all sit in earlier waves.
pub type Wave = BTreeSet<TaskType>;

/// Progress of every submitted task of one type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeProgress {
    pub total: usize,
    pub completed: usize,
    /// Tasks not yet in a terminal status.
    pub non_terminal: usize,
    /// Root cause of the earliest unsuccessful task of this type, if any.
    pub first_unsuccessful: Option<(TaskId, TaskType)>,
}

impl TypeProgress {
    /// No task of this type can still change status.
    pub fn is_resolved(&self) -> bool {
        self.non_terminal == 0
    }
}

/// Per-type progress snapshot handed to [`DependencyResolver::readiness`].
pub type ProgressMap = BTreeMap<TaskType, TypeProgress>;

/// Outcome of evaluating a pending task against its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "readiness")]
pub enum Readiness {
    Ready,
    /// A dependency type still has live tasks, or has none yet.
    Blocked,
    Skip { reason: SkipReason },
}

/// Static dependency graph over task types.
pub struct DependencyResolver {
    graph: DiGraph<TaskType, ()>,
    index: HashMap<TaskType, NodeIndex>,
}

impl DependencyResolver {
    /// Resolver over the full built-in task catalogue.
    pub fn new() -> Self {
        let mut resolver = Self::empty();
        for task_type in TaskType::ALL {
            resolver.add_type(task_type);
        }
        for task_type in TaskType::ALL {
            for dep in task_type.depends_on() {
                let (from, to) = (resolver.index[dep], resolver.index[&task_type]);
                resolver.graph.add_edge(from, to, ());
            }
        }
        resolver
    }

    fn empty() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Resolver over an explicit set of types and `(dependency, dependent)` edges.
    ///
    /// # Errors
    /// Returns `Error::Validation` if an edge names a type outside `types`
    /// or the edges form a cycle.
    pub fn from_edges(types: &[TaskType], edges: &[(TaskType, TaskType)]) -> Result<Self> {
        let mut resolver = Self::empty();
        for task_type in types {
            resolver.add_type(*task_type);
        }
        for (from, to) in edges {
            resolver.add_dependency(*from, *to)?;
        }
        Ok(resolver)
    }

    fn add_type(&mut self, task_type: TaskType) -> NodeIndex {
        if let Some(&index) = self.index.get(&task_type) {
            return index;
        }
        let index = self.graph.add_node(task_type);
        self.index.insert(task_type, index);
        index
    }

    /// Declare that `to` depends on `from`.
    ///
    /// # Errors
    /// Returns an error if either type is unknown or the edge would create a cycle.
    pub fn add_dependency(&mut self, from: TaskType, to: TaskType) -> Result<()> {
        let from_index = *self
            .index
            .get(&from)
            .ok_or_else(|| Error::Validation(format!("Task type {} not found in graph", from)))?;
        let to_index = *self
            .index
            .get(&to)
            .ok_or_else(|| Error::Validation(format!("Task type {} not found in graph", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.index.contains_key(&task_type)
    }

    /// All types in the graph, in canonical order.
    pub fn types(&self) -> BTreeSet<TaskType> {
        self.index.keys().copied().collect()
    }

    /// Direct dependencies of a type.
    pub fn depends_on(&self, task_type: TaskType) -> BTreeSet<TaskType> {
        self.neighbors(task_type, Direction::Incoming)
    }

    /// Types that directly depend on `task_type`.
    pub fn dependents(&self, task_type: TaskType) -> BTreeSet<TaskType> {
        self.neighbors(task_type, Direction::Outgoing)
    }

    fn neighbors(&self, task_type: TaskType, direction: Direction) -> BTreeSet<TaskType> {
        match self.index.get(&task_type) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n).copied())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// The requested types plus everything they transitively depend on.
    pub fn closure(&self, requested: &BTreeSet<TaskType>) -> BTreeSet<TaskType> {
        let mut result = BTreeSet::new();
        let mut stack: Vec<TaskType> = requested.iter().copied().collect();
        while let Some(task_type) = stack.pop() {
            if !self.contains(task_type) || !result.insert(task_type) {
                continue;
            }
            stack.extend(self.depends_on(task_type));
        }
        result
    }

    /// Partition the graph into execution waves.
    ///
    /// Each type lands in the wave after its deepest dependency, so every
    /// dependency sits in a strictly earlier wave.
    pub fn waves(&self) -> Result<Vec<Wave>> {
        self.waves_for(&self.types())
    }

    /// Waves restricted to a subset of types (edges to types outside the
    /// subset are ignored).
    pub fn waves_for(&self, subset: &BTreeSet<TaskType>) -> Result<Vec<Wave>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task type: {}", name))
        })?;

        let mut depth: HashMap<TaskType, usize> = HashMap::new();
        for index in sorted {
            let Some(&task_type) = self.graph.node_weight(index) else {
                continue;
            };
            if !subset.contains(&task_type) {
                continue;
            }
            let level = self
                .depends_on(task_type)
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(task_type, level);
        }

        let mut waves: Vec<Wave> = Vec::new();
        for (task_type, level) in depth {
            if waves.len() <= level {
                waves.resize_with(level + 1, BTreeSet::new);
            }
            waves[level].insert(task_type);
        }
        Ok(waves)
    }

    /// Decide whether a pending task with the given dependency set can run.
    ///
    /// Every dependency type must be resolved (no live tasks). If any of
    /// them holds an unsuccessful task the pending task is skipped, carrying
    /// the root cause; dependency types are checked in canonical order so
    /// the choice is deterministic. A dependency type with no tasks at all
    /// keeps the task blocked.
    pub fn readiness(&self, depends_on: &BTreeSet<TaskType>, progress: &ProgressMap) -> Readiness {
        let empty = TypeProgress::default();
        let deps: Vec<(TaskType, &TypeProgress)> = depends_on
            .iter()
            .map(|t| (*t, progress.get(t).unwrap_or(&empty)))
            .collect();

        if deps.iter().any(|(_, p)| !p.is_resolved()) {
            return Readiness::Blocked;
        }
        if let Some((task_id, task_type)) = deps.iter().find_map(|(_, p)| p.first_unsuccessful) {
            return Readiness::Skip {
                reason: SkipReason::DependencyFailed { task_id, task_type },
            };
        }
        if deps.iter().any(|(_, p)| p.completed == 0) {
            return Readiness::Blocked;
        }
        Readiness::Ready
    }

    /// The first dependency type that has no tasks, if any.
    pub fn missing_dependency(
        &self,
        depends_on: &BTreeSet<TaskType>,
        progress: &ProgressMap,
    ) -> Option<TaskType> {
        depends_on
            .iter()
            .find(|t| progress.get(t).map_or(true, |p| p.total == 0))
            .copied()
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyResolver")
            .field("types", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
