//! Semantic deadlock detection over priority/status dependencies
//!
//! Tasks can be coupled without ever contending for the same lock: task A's
//! priority may be gated on task B's status while B's status is gated on A's
//! priority. This detector layers those semantic edges on top of the base
//! lock detector and looks for four patterns, in order of urgency:
//!
//! 1. a lock-level deadlock reported by the base detector,
//! 2. a task whose priority and status are both gated at level 0,
//! 3. a two-task cycle with inverted coupling kinds,
//! 4. a long alternating chain of couplings (a cascade in the making),
//!
//! falling back to a generic report for any remaining dependency cycle.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TasklockConfig;
use crate::detect::detector::DeadlockDetector;
use crate::domain::{
    DependencyKind, DependencyRef, OperationId, PriorityStatusDependency, TaskId,
};

#[derive(Debug, Error, PartialEq)]
pub enum DependencyError {
    #[error("Dependency level {level} exceeds maximum {max}")]
    LevelTooDeep { level: u32, max: u32 },
    #[error("Task cannot depend on itself: {0}")]
    SelfDependency(TaskId),
}

/// How a semantic deadlock should be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticResolution {
    /// Remove the conflicting edges and pin the victim's priority gate open
    PriorityBoost,
    /// Remove every edge participating in the cycles
    StatusOverride,
    /// Abort the victim operations and strip their tasks' dependencies
    OperationRollback,
    /// Remove the single deepest edge of the chain
    DependencyBreak,
}

/// Urgency of a detected pattern
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Result of one semantic detection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticReport {
    pub deadlocked: bool,
    /// Task cycles found in the dependency graph
    pub cycles: Vec<Vec<TaskId>>,
    /// Dependency edges implicated in the finding
    pub edges: Vec<DependencyRef>,
    /// Tasks the resolution will touch
    pub victims: Vec<TaskId>,
    /// Operations the resolution will abort
    pub victim_operations: Vec<OperationId>,
    pub strategy: Option<SemanticResolution>,
    pub severity: Severity,
}

impl SemanticReport {
    fn clean() -> Self {
        Self {
            deadlocked: false,
            cycles: Vec::new(),
            edges: Vec::new(),
            victims: Vec::new(),
            victim_operations: Vec::new(),
            strategy: None,
            severity: Severity::Low,
        }
    }
}

/// Dependency graph statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SemanticStats {
    pub total_dependencies: usize,
    pub priority_depends_on_status: usize,
    pub status_depends_on_priority: usize,
    /// Level-0 edges only
    pub direct_dependencies: usize,
    pub tasks_with_dependencies: usize,
}

#[derive(Default)]
struct SemanticState {
    /// All registered edges, keyed by owning task
    deps: BTreeMap<TaskId, Vec<PriorityStatusDependency>>,
    /// Level-0 subset, kept separately for conflict checks and stats
    direct: BTreeMap<TaskId, Vec<PriorityStatusDependency>>,
}

/// Combined lock-level and semantic deadlock detector
pub struct PriorityStatusDetector {
    base: DeadlockDetector,
    state: Mutex<SemanticState>,
    max_level: u32,
    cascade_threshold: usize,
    max_chain_scan: usize,
}

impl PriorityStatusDetector {
    /// Creates a detector with default configuration
    pub fn new() -> Self {
        Self::with_config(&TasklockConfig::default())
    }

    /// Creates a detector using the given limits
    pub fn with_config(config: &TasklockConfig) -> Self {
        Self {
            base: DeadlockDetector::with_config(&config.lock),
            state: Mutex::new(SemanticState::default()),
            max_level: config.dependency.max_level,
            cascade_threshold: config.dependency.cascade_threshold,
            max_chain_scan: config.dependency.max_chain_scan,
        }
    }

    /// The underlying lock-level detector
    pub fn base(&self) -> &DeadlockDetector {
        &self.base
    }

    /// Registers a semantic dependency edge
    ///
    /// An edge with the same target, kind, and level as an existing one
    /// replaces it, so re-registering refreshes the condition.
    pub fn add_dependency(
        &self,
        dep: PriorityStatusDependency,
    ) -> Result<(), DependencyError> {
        if dep.task_id == dep.depends_on {
            return Err(DependencyError::SelfDependency(dep.task_id));
        }
        if dep.level > self.max_level {
            return Err(DependencyError::LevelTooDeep {
                level: dep.level,
                max: self.max_level,
            });
        }

        let mut state = self.state.lock();
        debug!(
            task = %dep.task_id,
            depends_on = %dep.depends_on,
            kind = %dep.kind,
            level = dep.level,
            "dependency registered"
        );
        insert_edge(&mut state, dep);
        Ok(())
    }

    /// Runs one detection pass and reports the most urgent finding
    pub fn detect(&self) -> SemanticReport {
        let base_report = self.base.detect_deadlock();
        if base_report.deadlocked {
            let victim_ops: Vec<OperationId> = base_report.victim.into_iter().collect();
            let victims: Vec<TaskId> = victim_ops
                .iter()
                .flat_map(|op| self.base.tasks_held_by(*op))
                .collect();
            return SemanticReport {
                deadlocked: true,
                cycles: Vec::new(),
                edges: Vec::new(),
                victims,
                victim_operations: victim_ops,
                strategy: Some(SemanticResolution::OperationRollback),
                severity: Severity::High,
            };
        }

        let state = self.state.lock();

        if let Some(report) = level0_conflict(&state) {
            warn!(victim = %report.victims[0], "level-0 priority/status conflict");
            return report;
        }

        let cycles = collect_cycles(&state);

        if let Some(report) = inverted_pair(&state, &cycles) {
            warn!(victim = %report.victims[0], "inverted dependency pair");
            return report;
        }

        if let Some(report) =
            cascading_chain(&state, self.cascade_threshold, self.max_chain_scan)
        {
            warn!(
                victim = %report.victims[0],
                chain_len = report.edges.len(),
                "cascading dependency chain"
            );
            return report;
        }

        if !cycles.is_empty() {
            warn!(cycles = cycles.len(), "dependency cycles detected");
            let edges = cycle_edges(&state, &cycles);
            return SemanticReport {
                deadlocked: true,
                cycles,
                edges,
                victims: Vec::new(),
                victim_operations: Vec::new(),
                strategy: Some(SemanticResolution::StatusOverride),
                severity: Severity::High,
            };
        }

        SemanticReport::clean()
    }

    /// Applies the report's resolution, returning the removed edges
    pub fn resolve(&self, report: &SemanticReport) -> Vec<DependencyRef> {
        let Some(strategy) = report.strategy else {
            return Vec::new();
        };
        match strategy {
            SemanticResolution::PriorityBoost => {
                let mut state = self.state.lock();
                let mut removed = Vec::new();
                for edge in &report.edges {
                    if remove_edge(&mut state, edge) {
                        removed.push(edge.clone());
                    }
                }
                // A critical conflict leaves the victim with no way to make
                // progress on its own; pin its status gate to the always-high
                // sentinel so the next evaluation lets it through.
                if report.severity == Severity::Critical {
                    for (victim, cycle) in report.victims.iter().zip(&report.cycles) {
                        if cycle.len() > 2 {
                            info!(victim = %victim, "pinning status gate to high-priority sentinel");
                            insert_edge(
                                &mut state,
                                PriorityStatusDependency::unconditional(
                                    victim.clone(),
                                    TaskId::system_high_priority(),
                                    DependencyKind::StatusDependsOnPriority,
                                    0,
                                ),
                            );
                        }
                    }
                }
                removed
            }
            SemanticResolution::StatusOverride => {
                let mut state = self.state.lock();
                let mut removed = Vec::new();
                for edge in &report.edges {
                    if remove_edge(&mut state, edge) {
                        removed.push(edge.clone());
                    }
                }
                removed
            }
            SemanticResolution::OperationRollback => {
                // Base aborts first, without the semantic lock held
                let mut touched: BTreeSet<TaskId> = report.victims.iter().cloned().collect();
                for op in &report.victim_operations {
                    for (task, _) in self.base.abort_operation(*op) {
                        touched.insert(task);
                    }
                }
                let mut state = self.state.lock();
                let mut removed = Vec::new();
                for task in &touched {
                    removed.extend(strip_task(&mut state, task));
                }
                removed
            }
            SemanticResolution::DependencyBreak => {
                let mut state = self.state.lock();
                let mut deepest: Option<&DependencyRef> = None;
                for edge in &report.edges {
                    if deepest.is_none_or(|best| edge.level > best.level) {
                        deepest = Some(edge);
                    }
                }
                let mut removed = Vec::new();
                if let Some(edge) = deepest {
                    if remove_edge(&mut state, edge) {
                        info!(edge = %edge, "breaking deepest chain edge");
                        removed.push(edge.clone());
                    }
                }
                removed
            }
        }
    }

    /// Removes every edge owned by or pointing at `task`
    pub fn remove_dependencies_of(&self, task: &TaskId) -> Vec<DependencyRef> {
        let mut state = self.state.lock();
        strip_task(&mut state, task)
    }

    /// Snapshot of all registered edges
    pub fn dependencies(&self) -> Vec<DependencyRef> {
        let state = self.state.lock();
        state
            .deps
            .values()
            .flat_map(|edges| edges.iter().map(PriorityStatusDependency::to_ref))
            .collect()
    }

    /// Counts over the dependency graph
    pub fn stats(&self) -> SemanticStats {
        let state = self.state.lock();
        let mut stats = SemanticStats::default();
        for edges in state.deps.values() {
            stats.total_dependencies += edges.len();
            if !edges.is_empty() {
                stats.tasks_with_dependencies += 1;
            }
            for edge in edges {
                match edge.kind {
                    DependencyKind::PriorityDependsOnStatus => {
                        stats.priority_depends_on_status += 1
                    }
                    DependencyKind::StatusDependsOnPriority => {
                        stats.status_depends_on_priority += 1
                    }
                }
            }
        }
        stats.direct_dependencies = state.direct.values().map(Vec::len).sum();
        stats
    }

    /// Shuts down the detector, clearing all semantic edges
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.deps.clear();
            state.direct.clear();
        }
        self.base.close();
    }
}

impl Default for PriorityStatusDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_edge(state: &mut SemanticState, dep: PriorityStatusDependency) {
    let same_slot = |existing: &PriorityStatusDependency| {
        existing.depends_on == dep.depends_on
            && existing.kind == dep.kind
            && existing.level == dep.level
    };
    let edges = state.deps.entry(dep.task_id.clone()).or_default();
    edges.retain(|existing| !same_slot(existing));
    edges.push(dep.clone());

    if dep.level == 0 {
        let direct = state.direct.entry(dep.task_id.clone()).or_default();
        direct.retain(|existing| !same_slot(existing));
        direct.push(dep);
    }
}

fn remove_edge(state: &mut SemanticState, edge: &DependencyRef) -> bool {
    let matches = |existing: &PriorityStatusDependency| {
        existing.depends_on == edge.depends_on
            && existing.kind == edge.kind
            && existing.level == edge.level
    };
    let mut removed = false;
    if let Some(edges) = state.deps.get_mut(&edge.task_id) {
        let before = edges.len();
        edges.retain(|existing| !matches(existing));
        removed = edges.len() < before;
        if edges.is_empty() {
            state.deps.remove(&edge.task_id);
        }
    }
    if let Some(direct) = state.direct.get_mut(&edge.task_id) {
        direct.retain(|existing| !matches(existing));
        if direct.is_empty() {
            state.direct.remove(&edge.task_id);
        }
    }
    removed
}

fn strip_task(state: &mut SemanticState, task: &TaskId) -> Vec<DependencyRef> {
    let mut removed = Vec::new();
    if let Some(edges) = state.deps.remove(task) {
        removed.extend(edges.iter().map(PriorityStatusDependency::to_ref));
    }
    state.direct.remove(task);

    let owners: Vec<TaskId> = state.deps.keys().cloned().collect();
    for owner in owners {
        if let Some(edges) = state.deps.get_mut(&owner) {
            let (gone, kept): (Vec<_>, Vec<_>) = edges
                .drain(..)
                .partition(|edge| edge.depends_on == *task);
            removed.extend(gone.iter().map(PriorityStatusDependency::to_ref));
            *edges = kept;
            if edges.is_empty() {
                state.deps.remove(&owner);
            }
        }
        if let Some(direct) = state.direct.get_mut(&owner) {
            direct.retain(|edge| edge.depends_on != *task);
            if direct.is_empty() {
                state.direct.remove(&owner);
            }
        }
    }
    removed
}

/// One task whose priority and status are both externally gated at level 0
fn level0_conflict(state: &SemanticState) -> Option<SemanticReport> {
    for (task, edges) in &state.direct {
        let psd = edges
            .iter()
            .find(|e| e.kind == DependencyKind::PriorityDependsOnStatus);
        let sdp = edges
            .iter()
            .find(|e| e.kind == DependencyKind::StatusDependsOnPriority);
        if let (Some(psd), Some(sdp)) = (psd, sdp) {
            return Some(SemanticReport {
                deadlocked: true,
                cycles: vec![vec![
                    task.clone(),
                    psd.depends_on.clone(),
                    sdp.depends_on.clone(),
                ]],
                edges: edges.iter().map(PriorityStatusDependency::to_ref).collect(),
                victims: vec![task.clone()],
                victim_operations: Vec::new(),
                strategy: Some(SemanticResolution::PriorityBoost),
                severity: Severity::Critical,
            });
        }
    }
    None
}

/// A two-task cycle whose edges couple in opposite directions
fn inverted_pair(state: &SemanticState, cycles: &[Vec<TaskId>]) -> Option<SemanticReport> {
    for cycle in cycles {
        let [a, b] = cycle.as_slice() else {
            continue;
        };
        let Some(forward) = find_edge(state, a, b) else {
            continue;
        };
        let Some(backward) = find_edge(state, b, a) else {
            continue;
        };
        if forward.kind == backward.kind {
            continue;
        }
        let victim = if forward.kind == DependencyKind::StatusDependsOnPriority {
            a.clone()
        } else {
            b.clone()
        };
        return Some(SemanticReport {
            deadlocked: true,
            cycles: vec![cycle.clone()],
            edges: vec![forward.to_ref(), backward.to_ref()],
            victims: vec![victim],
            victim_operations: Vec::new(),
            strategy: Some(SemanticResolution::PriorityBoost),
            severity: Severity::High,
        });
    }
    None
}

/// A long chain of alternating couplings, broken at its midpoint
fn cascading_chain(
    state: &SemanticState,
    cascade_threshold: usize,
    max_chain_scan: usize,
) -> Option<SemanticReport> {
    for task in state.deps.keys() {
        let mut visited = BTreeSet::from([task.clone()]);
        let chain = longest_chain(state, task, None, &mut visited, max_chain_scan);
        if chain.len() >= cascade_threshold {
            let victim = chain[chain.len() / 2].task_id.clone();
            return Some(SemanticReport {
                deadlocked: true,
                cycles: Vec::new(),
                edges: chain,
                victims: vec![victim],
                victim_operations: Vec::new(),
                strategy: Some(SemanticResolution::DependencyBreak),
                severity: Severity::High,
            });
        }
    }
    None
}

fn longest_chain(
    state: &SemanticState,
    task: &TaskId,
    prev_kind: Option<DependencyKind>,
    visited: &mut BTreeSet<TaskId>,
    budget: usize,
) -> Vec<DependencyRef> {
    if budget == 0 {
        return Vec::new();
    }
    let mut best: Vec<DependencyRef> = Vec::new();
    let Some(edges) = state.deps.get(task) else {
        return best;
    };
    for edge in edges {
        if prev_kind.is_some_and(|prev| prev == edge.kind) {
            continue;
        }
        if visited.contains(&edge.depends_on) {
            continue;
        }
        visited.insert(edge.depends_on.clone());
        let mut chain = vec![edge.to_ref()];
        chain.extend(longest_chain(
            state,
            &edge.depends_on,
            Some(edge.kind),
            visited,
            budget - 1,
        ));
        visited.remove(&edge.depends_on);
        if chain.len() > best.len() {
            best = chain;
        }
    }
    best
}

/// Enumerates simple cycles, each rooted at its smallest task ID
fn collect_cycles(state: &SemanticState) -> Vec<Vec<TaskId>> {
    let mut cycles: Vec<Vec<TaskId>> = Vec::new();
    for start in state.deps.keys() {
        let mut path = vec![start.clone()];
        let mut on_path = BTreeSet::from([start.clone()]);
        let mut stack = vec![(start.clone(), neighbors(state, start))];

        loop {
            let next = match stack.last_mut() {
                Some((_, pending)) => pending.pop(),
                None => break,
            };
            match next {
                Some(next) => {
                    if next == *start {
                        if !cycles.contains(&path) {
                            cycles.push(path.clone());
                        }
                        continue;
                    }
                    // Only roots may be the smallest node of their cycle
                    if next < *start || on_path.contains(&next) {
                        continue;
                    }
                    on_path.insert(next.clone());
                    path.push(next.clone());
                    stack.push((next.clone(), neighbors(state, &next)));
                }
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        on_path.remove(&done);
                    }
                }
            }
        }
    }
    cycles
}

// Distinct targets, reversed so Vec::pop visits them in ascending order.
fn neighbors(state: &SemanticState, task: &TaskId) -> Vec<TaskId> {
    let targets: BTreeSet<TaskId> = state
        .deps
        .get(task)
        .map(|edges| edges.iter().map(|e| e.depends_on.clone()).collect())
        .unwrap_or_default();
    targets.into_iter().rev().collect()
}

fn find_edge<'a>(
    state: &'a SemanticState,
    from: &TaskId,
    to: &TaskId,
) -> Option<&'a PriorityStatusDependency> {
    state
        .deps
        .get(from)?
        .iter()
        .find(|edge| edge.depends_on == *to)
}

fn cycle_edges(state: &SemanticState, cycles: &[Vec<TaskId>]) -> Vec<DependencyRef> {
    let mut refs: Vec<DependencyRef> = Vec::new();
    for cycle in cycles {
        for (i, from) in cycle.iter().enumerate() {
            let to = &cycle[(i + 1) % cycle.len()];
            if let Some(edge) = find_edge(state, from, to) {
                let edge_ref = edge.to_ref();
                if !refs.contains(&edge_ref) {
                    refs.push(edge_ref);
                }
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::lock_table::ResourceType;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use DependencyKind::{PriorityDependsOnStatus as Psd, StatusDependsOnPriority as Sdp};

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    fn op(n: u64) -> OperationId {
        OperationId::from_u64(n)
    }

    fn edge(from: &str, to: &str, kind: DependencyKind, level: u32) -> PriorityStatusDependency {
        PriorityStatusDependency::unconditional(tid(from), tid(to), kind, level)
    }

    #[test]
    fn add_and_count_dependencies() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("a", "b", Psd, 0)).unwrap();
        det.add_dependency(edge("a", "c", Sdp, 1)).unwrap();
        det.add_dependency(edge("b", "c", Psd, 2)).unwrap();

        let stats = det.stats();
        assert_eq!(stats.total_dependencies, 3);
        assert_eq!(stats.priority_depends_on_status, 2);
        assert_eq!(stats.status_depends_on_priority, 1);
        assert_eq!(stats.direct_dependencies, 1);
        assert_eq!(stats.tasks_with_dependencies, 2);
        det.close();
    }

    #[test]
    fn rejects_level_beyond_maximum() {
        let det = PriorityStatusDetector::new();
        assert_eq!(
            det.add_dependency(edge("a", "b", Psd, 4)),
            Err(DependencyError::LevelTooDeep { level: 4, max: 3 })
        );
        det.add_dependency(edge("a", "b", Psd, 3)).unwrap();
        det.close();
    }

    #[test]
    fn rejects_self_dependency() {
        let det = PriorityStatusDetector::new();
        assert_eq!(
            det.add_dependency(edge("a", "a", Psd, 0)),
            Err(DependencyError::SelfDependency(tid("a")))
        );
        det.close();
    }

    #[test]
    fn duplicate_edge_replaces_existing() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("a", "b", Psd, 1)).unwrap();
        det.add_dependency(edge("a", "b", Psd, 1)).unwrap();
        assert_eq!(det.stats().total_dependencies, 1);

        // Different level is a distinct slot
        det.add_dependency(edge("a", "b", Psd, 2)).unwrap();
        assert_eq!(det.stats().total_dependencies, 2);
        det.close();
    }

    #[test]
    fn empty_graph_is_clean() {
        let det = PriorityStatusDetector::new();
        let report = det.detect();
        assert!(!report.deadlocked);
        assert_eq!(report.strategy, None);
        assert_eq!(report.severity, Severity::Low);
        assert!(det.resolve(&report).is_empty());
        det.close();
    }

    #[test]
    fn acyclic_graph_is_clean() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("a", "b", Psd, 0)).unwrap();
        det.add_dependency(edge("b", "c", Psd, 1)).unwrap();
        assert!(!det.detect().deadlocked);
        det.close();
    }

    #[test]
    fn level0_conflict_is_critical() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("t", "u", Psd, 0)).unwrap();
        det.add_dependency(edge("t", "v", Sdp, 0)).unwrap();

        let report = det.detect();
        assert!(report.deadlocked);
        assert_eq!(report.severity, Severity::Critical);
        assert_eq!(report.strategy, Some(SemanticResolution::PriorityBoost));
        assert_eq!(report.victims, vec![tid("t")]);
        assert_eq!(report.cycles, vec![vec![tid("t"), tid("u"), tid("v")]]);
        assert_eq!(report.edges.len(), 2);
        det.close();
    }

    #[test]
    fn resolving_level0_conflict_pins_sentinel() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("t", "u", Psd, 0)).unwrap();
        det.add_dependency(edge("t", "v", Sdp, 0)).unwrap();

        let report = det.detect();
        let removed = det.resolve(&report);
        assert_eq!(removed.len(), 2);

        let deps = det.dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].task_id, tid("t"));
        assert_eq!(deps[0].depends_on, TaskId::system_high_priority());
        assert_eq!(deps[0].kind, Sdp);
        assert_eq!(deps[0].level, 0);

        // The sentinel edge alone is not a conflict
        assert!(!det.detect().deadlocked);
        det.close();
    }

    #[test]
    fn inverted_pair_boosts_the_status_gated_task() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("a", "b", Psd, 1)).unwrap();
        det.add_dependency(edge("b", "a", Sdp, 1)).unwrap();

        let report = det.detect();
        assert!(report.deadlocked);
        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.strategy, Some(SemanticResolution::PriorityBoost));
        assert_eq!(report.victims, vec![tid("b")]);
        assert_eq!(report.cycles, vec![vec![tid("a"), tid("b")]]);

        let removed = det.resolve(&report);
        assert_eq!(removed.len(), 2);
        // High severity does not add the sentinel
        assert!(det.dependencies().is_empty());
        assert!(!det.detect().deadlocked);
        det.close();
    }

    #[test]
    fn level0_conflict_outranks_inverted_pair() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("x", "y", Psd, 1)).unwrap();
        det.add_dependency(edge("y", "x", Sdp, 1)).unwrap();
        det.add_dependency(edge("t", "u", Psd, 0)).unwrap();
        det.add_dependency(edge("t", "v", Sdp, 0)).unwrap();

        let report = det.detect();
        assert_eq!(report.severity, Severity::Critical);
        assert_eq!(report.victims, vec![tid("t")]);
        det.close();
    }

    #[test]
    fn cascading_chain_breaks_at_midpoint() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("t1", "t2", Psd, 1)).unwrap();
        det.add_dependency(edge("t2", "t3", Sdp, 2)).unwrap();
        det.add_dependency(edge("t3", "t4", Psd, 2)).unwrap();
        det.add_dependency(edge("t4", "t5", Sdp, 1)).unwrap();

        let report = det.detect();
        assert!(report.deadlocked);
        assert_eq!(report.strategy, Some(SemanticResolution::DependencyBreak));
        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.edges.len(), 4);
        assert_eq!(report.victims, vec![tid("t3")]);

        // Ties on level keep the earliest edge, t2 -> t3 here
        let removed = det.resolve(&report);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].task_id, tid("t2"));
        assert_eq!(removed[0].depends_on, tid("t3"));

        assert!(!det.detect().deadlocked);
        det.close();
    }

    #[test]
    fn chain_without_alternation_is_not_a_cascade() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("t1", "t2", Psd, 1)).unwrap();
        det.add_dependency(edge("t2", "t3", Psd, 1)).unwrap();
        det.add_dependency(edge("t3", "t4", Psd, 1)).unwrap();
        det.add_dependency(edge("t4", "t5", Psd, 1)).unwrap();

        assert!(!det.detect().deadlocked);
        det.close();
    }

    #[test]
    fn generic_cycle_resolved_by_status_override() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("a", "b", Psd, 1)).unwrap();
        det.add_dependency(edge("b", "c", Psd, 1)).unwrap();
        det.add_dependency(edge("c", "a", Psd, 1)).unwrap();

        let report = det.detect();
        assert!(report.deadlocked);
        assert_eq!(report.strategy, Some(SemanticResolution::StatusOverride));
        assert_eq!(report.cycles, vec![vec![tid("a"), tid("b"), tid("c")]]);
        assert_eq!(report.edges.len(), 3);
        assert!(report.victims.is_empty());

        let removed = det.resolve(&report);
        assert_eq!(removed.len(), 3);
        assert!(det.dependencies().is_empty());
        assert!(!det.detect().deadlocked);
        det.close();
    }

    #[test]
    fn remove_dependencies_of_strips_both_directions() {
        let det = PriorityStatusDetector::new();
        det.add_dependency(edge("a", "b", Psd, 1)).unwrap();
        det.add_dependency(edge("c", "a", Sdp, 1)).unwrap();
        det.add_dependency(edge("c", "d", Psd, 1)).unwrap();

        let removed = det.remove_dependencies_of(&tid("a"));
        assert_eq!(removed.len(), 2);

        let deps = det.dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].task_id, tid("c"));
        assert_eq!(deps[0].depends_on, tid("d"));
        det.close();
    }

    #[test]
    fn base_deadlock_outranks_semantic_findings() {
        let det = Arc::new(PriorityStatusDetector::new());
        det.add_dependency(edge("t", "u", Psd, 0)).unwrap();
        det.add_dependency(edge("t", "v", Sdp, 0)).unwrap();
        det.add_dependency(edge("y", "c", Psd, 1)).unwrap();

        let timeout = Duration::from_secs(5);
        let base = det.base();
        assert!(base.acquire_lock(op(1), &tid("a"), ResourceType::Status, timeout));
        assert!(base.acquire_lock(op(2), &tid("b"), ResourceType::Status, timeout));
        assert!(base.acquire_lock(op(3), &tid("c"), ResourceType::Status, timeout));

        let spawn_waiter = |o: OperationId, held: &str, wanted: &str| {
            let det = Arc::clone(&det);
            let held = tid(held);
            let wanted = tid(wanted);
            thread::spawn(move || {
                let got = det.base().acquire_lock(o, &wanted, ResourceType::Status, timeout);
                if got {
                    det.base().release_lock(o, &wanted, ResourceType::Status);
                    det.base().release_lock(o, &held, ResourceType::Status);
                }
                got
            })
        };
        let t1 = spawn_waiter(op(1), "a", "b");
        thread::sleep(Duration::from_millis(50));
        let t2 = spawn_waiter(op(2), "b", "c");
        thread::sleep(Duration::from_millis(50));
        let t3 = spawn_waiter(op(3), "c", "a");
        thread::sleep(Duration::from_millis(100));

        let report = det.detect();
        assert!(report.deadlocked);
        assert_eq!(report.strategy, Some(SemanticResolution::OperationRollback));
        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.victim_operations, vec![op(3)]);
        assert_eq!(report.victims, vec![tid("c")]);

        let removed = det.resolve(&report);
        assert!(det.base().is_aborted(op(3)));
        // c's semantic edge went with it; unrelated edges on t survive
        assert!(removed.iter().any(|e| e.depends_on == tid("c")));
        assert_eq!(det.stats().total_dependencies, 2);

        assert!(!t3.join().unwrap());
        assert!(t2.join().unwrap());
        assert!(t1.join().unwrap());

        // With the lock cycle gone, the semantic conflict surfaces next
        let report = det.detect();
        assert_eq!(report.severity, Severity::Critical);
        det.close();
    }
}
