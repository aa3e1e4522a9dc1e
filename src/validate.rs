//! Standalone dependency validation and graph analysis
//!
//! Validates a proposed priority/status dependency against a cached view of
//! the task set before it is registered anywhere: both endpoints must exist,
//! the condition must evaluate cleanly, and the edge must not close a cycle.
//! Also answers structural questions (chain depth, bottleneck tasks) about
//! the accepted graph.

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

use crate::config::DependencyConfig;
use crate::domain::{DependencyKind, PriorityStatusDependency, Task, TaskId};

/// Levels above this are accepted with a warning
const WARN_LEVEL: u32 = 5;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("Dependency condition failed for task {task}: {reason}")]
    ConditionFailed { task: TaskId, reason: String },
    #[error("Task cannot depend on itself: {0}")]
    SelfDependency(TaskId),
    #[error("Adding dependency from {0} to {1} would create a cycle")]
    CycleDetected(TaskId, TaskId),
}

/// A task with more dependents than the configured threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub task_id: TaskId,
    pub dependents: usize,
}

/// Structural summary of the accepted dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependencyAnalysis {
    /// Longest dependency chain, in edges
    pub max_chain_depth: usize,
    /// Most-depended-on tasks, busiest first
    pub bottlenecks: Vec<Bottleneck>,
}

/// Validates dependencies against a cached task set
pub struct DependencyValidator {
    graph: DiGraph<TaskId, DependencyKind>,
    node_map: HashMap<TaskId, NodeIndex>,
    tasks: HashMap<TaskId, Task>,
    bottleneck_threshold: usize,
}

impl DependencyValidator {
    /// Creates a validator with default limits
    pub fn new() -> Self {
        Self::with_config(&DependencyConfig::default())
    }

    /// Creates a validator using the given limits
    pub fn with_config(config: &DependencyConfig) -> Self {
        Self {
            graph: DiGraph::new(),
            node_map: HashMap::new(),
            tasks: HashMap::new(),
            bottleneck_threshold: config.bottleneck_threshold,
        }
    }

    /// Caches or refreshes a task snapshot
    pub fn update_task(&mut self, task: Task) {
        self.ensure_node(&task.id);
        self.tasks.insert(task.id.clone(), task);
    }

    /// Drops a task, its cached snapshot, and every edge touching it
    pub fn remove_task(&mut self, id: &TaskId) {
        self.tasks.remove(id);
        if let Some(idx) = self.node_map.remove(id) {
            self.graph.remove_node(idx);
            // remove_node invalidates other indices
            self.rebuild_node_map();
        }
    }

    /// Number of cached tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of accepted dependency edges
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Checks a proposed dependency without recording it
    ///
    /// Returns advisory warnings on success. The condition is evaluated
    /// against the cached snapshots; a condition that returns an error fails
    /// validation, one that returns false merely does not bind right now.
    pub fn validate_dependency(
        &self,
        dep: &PriorityStatusDependency,
    ) -> Result<Vec<String>, ValidationError> {
        let task = self
            .tasks
            .get(&dep.task_id)
            .ok_or_else(|| ValidationError::TaskNotFound(dep.task_id.clone()))?;
        let target = self
            .tasks
            .get(&dep.depends_on)
            .ok_or_else(|| ValidationError::TaskNotFound(dep.depends_on.clone()))?;

        if let Err(e) = (dep.condition)(task, target) {
            return Err(ValidationError::ConditionFailed {
                task: dep.task_id.clone(),
                reason: format!("{e:#}"),
            });
        }

        let mut warnings = Vec::new();
        if dep.level > WARN_LEVEL {
            warnings.push(format!(
                "Dependency level {} is unusually deep (task {})",
                dep.level, dep.task_id
            ));
        }

        if dep.task_id == dep.depends_on {
            return Err(ValidationError::SelfDependency(dep.task_id.clone()));
        }

        let (Some(&task_idx), Some(&target_idx)) = (
            self.node_map.get(&dep.task_id),
            self.node_map.get(&dep.depends_on),
        ) else {
            return Ok(warnings);
        };

        // The new edge task -> depends_on closes a cycle exactly when the
        // reverse path already exists.
        if has_path_connecting(&self.graph, target_idx, task_idx, None) {
            return Err(ValidationError::CycleDetected(
                dep.task_id.clone(),
                dep.depends_on.clone(),
            ));
        }

        Ok(warnings)
    }

    /// Validates and records a dependency edge
    pub fn record_dependency(
        &mut self,
        dep: &PriorityStatusDependency,
    ) -> Result<Vec<String>, ValidationError> {
        let warnings = self.validate_dependency(dep)?;
        let task_idx = self.ensure_node(&dep.task_id);
        let target_idx = self.ensure_node(&dep.depends_on);

        let already = self
            .graph
            .edges_connecting(task_idx, target_idx)
            .any(|edge| *edge.weight() == dep.kind);
        if !already {
            self.graph.add_edge(task_idx, target_idx, dep.kind);
            debug!(task = %dep.task_id, depends_on = %dep.depends_on, kind = %dep.kind, "dependency recorded");
        }
        Ok(warnings)
    }

    /// Computes chain depth and bottleneck tasks over the accepted graph
    pub fn analyze(&self) -> DependencyAnalysis {
        let mut bottlenecks: Vec<Bottleneck> = Vec::new();
        for idx in self.graph.node_indices() {
            let dependents: BTreeSet<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .collect();
            if dependents.len() > self.bottleneck_threshold {
                bottlenecks.push(Bottleneck {
                    task_id: self.graph[idx].clone(),
                    dependents: dependents.len(),
                });
            }
        }
        bottlenecks.sort_by(|a, b| {
            b.dependents
                .cmp(&a.dependents)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        let order = match toposort(&self.graph, None) {
            Ok(order) => order,
            Err(_) => {
                return DependencyAnalysis {
                    max_chain_depth: 0,
                    bottlenecks,
                }
            }
        };

        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in order.iter().rev() {
            let best = self
                .graph
                .neighbors_directed(*idx, Direction::Outgoing)
                .map(|next| 1 + depth.get(&next).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            depth.insert(*idx, best);
        }

        DependencyAnalysis {
            max_chain_depth: depth.values().copied().max().unwrap_or(0),
            bottlenecks,
        }
    }

    fn ensure_node(&mut self, id: &TaskId) -> NodeIndex {
        if let Some(&idx) = self.node_map.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.node_map.insert(id.clone(), idx);
        idx
    }

    fn rebuild_node_map(&mut self) {
        self.node_map.clear();
        for idx in self.graph.node_indices() {
            self.node_map.insert(self.graph[idx].clone(), idx);
        }
    }
}

impl Default for DependencyValidator {
    fn default() -> Self {
        Self::new()
    }
}
