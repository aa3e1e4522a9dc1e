//! Wait-for graph over in-flight operations
//!
//! An edge `a -> b` records that operation `a` is blocked waiting for a lock
//! held by operation `b`. A cycle in this graph is a deadlock. Adjacency is
//! kept in ordered maps so traversal order, and therefore victim choice, is
//! deterministic for a given graph shape.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::OperationId;

/// A deadlock cycle found in the wait-for graph
///
/// `victim` is the operation that closed the cycle, the most recent waiter
/// on the traversal path. Aborting it frees every other participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitCycle {
    pub path: Vec<OperationId>,
    pub victim: OperationId,
}

/// Directed graph of which operation waits on which
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: BTreeMap<OperationId, BTreeSet<OperationId>>,
    reverse_edges: BTreeMap<OperationId, BTreeSet<OperationId>>,
}

impl WaitForGraph {
    /// Creates an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `waiter` is blocked on `holder`
    pub fn add_edge(&mut self, waiter: OperationId, holder: OperationId) {
        self.edges.entry(waiter).or_default().insert(holder);
        self.reverse_edges.entry(holder).or_default().insert(waiter);
    }

    /// Removes the edge `waiter -> holder` if present
    pub fn remove_edge(&mut self, waiter: OperationId, holder: OperationId) {
        if let Some(targets) = self.edges.get_mut(&waiter) {
            targets.remove(&holder);
            if targets.is_empty() {
                self.edges.remove(&waiter);
            }
        }
        if let Some(sources) = self.reverse_edges.get_mut(&holder) {
            sources.remove(&waiter);
            if sources.is_empty() {
                self.reverse_edges.remove(&holder);
            }
        }
    }

    /// Removes every edge out of `op` (it is no longer waiting on anyone)
    pub fn remove_outgoing(&mut self, op: OperationId) {
        if let Some(targets) = self.edges.remove(&op) {
            for target in targets {
                if let Some(sources) = self.reverse_edges.get_mut(&target) {
                    sources.remove(&op);
                    if sources.is_empty() {
                        self.reverse_edges.remove(&target);
                    }
                }
            }
        }
    }

    /// Removes `op` entirely, as waiter and as holder
    pub fn remove_operation(&mut self, op: OperationId) {
        self.remove_outgoing(op);
        if let Some(sources) = self.reverse_edges.remove(&op) {
            for source in sources {
                if let Some(targets) = self.edges.get_mut(&source) {
                    targets.remove(&op);
                    if targets.is_empty() {
                        self.edges.remove(&source);
                    }
                }
            }
        }
    }

    /// Returns true if the edge `waiter -> holder` exists
    pub fn waits_on(&self, waiter: OperationId, holder: OperationId) -> bool {
        self.edges
            .get(&waiter)
            .is_some_and(|targets| targets.contains(&holder))
    }

    /// Total number of edges
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|targets| targets.len()).sum()
    }

    /// Returns true if no edges exist
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Drops all edges
    pub fn clear(&mut self) {
        self.edges.clear();
        self.reverse_edges.clear();
    }

    /// Finds one cycle, if any exists
    ///
    /// Depth-first from each unvisited node; a back-edge onto the current
    /// path closes a cycle. Nodes finished once are never revisited.
    pub fn find_cycle(&self) -> Option<WaitCycle> {
        let mut visited: BTreeSet<OperationId> = BTreeSet::new();
        for &start in self.edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            if let Some(cycle) = self.cycle_from(start, &mut visited) {
                return Some(cycle);
            }
        }
        None
    }

    fn cycle_from(
        &self,
        start: OperationId,
        visited: &mut BTreeSet<OperationId>,
    ) -> Option<WaitCycle> {
        let mut on_stack: BTreeSet<OperationId> = BTreeSet::new();
        let mut path: Vec<OperationId> = Vec::new();
        let mut stack: Vec<(OperationId, Vec<OperationId>)> = Vec::new();

        visited.insert(start);
        on_stack.insert(start);
        path.push(start);
        stack.push((start, self.neighbors(start)));

        loop {
            let next = match stack.last_mut() {
                Some((_, pending)) => pending.pop(),
                None => break,
            };
            match next {
                Some(next) => {
                    if on_stack.contains(&next) {
                        let pos = path.iter().position(|&n| n == next).unwrap_or(0);
                        let victim = *path.last().unwrap_or(&next);
                        return Some(WaitCycle {
                            path: path[pos..].to_vec(),
                            victim,
                        });
                    }
                    if visited.insert(next) {
                        on_stack.insert(next);
                        path.push(next);
                        stack.push((next, self.neighbors(next)));
                    }
                }
                None => {
                    if let Some((done, _)) = stack.pop() {
                        on_stack.remove(&done);
                        path.pop();
                    }
                }
            }
        }
        None
    }

    // Reversed so Vec::pop visits targets in ascending order.
    fn neighbors(&self, op: OperationId) -> Vec<OperationId> {
        self.edges
            .get(&op)
            .map(|targets| targets.iter().rev().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(n: u64) -> OperationId {
        OperationId::from_u64(n)
    }

    #[test]
    fn add_and_query_edges() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));

        assert!(graph.waits_on(op(1), op(2)));
        assert!(!graph.waits_on(op(2), op(1)));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn add_edge_is_idempotent() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(1), op(2));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn remove_edge_cleans_both_directions() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.remove_edge(op(1), op(2));

        assert!(!graph.waits_on(op(1), op(2)));
        assert!(graph.is_empty());
    }

    #[test]
    fn remove_outgoing_keeps_incoming() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(1), op(3));
        graph.add_edge(op(4), op(1));

        graph.remove_outgoing(op(1));

        assert!(!graph.waits_on(op(1), op(2)));
        assert!(!graph.waits_on(op(1), op(3)));
        assert!(graph.waits_on(op(4), op(1)));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn remove_operation_strips_both_directions() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(3), op(1));
        graph.add_edge(op(3), op(4));

        graph.remove_operation(op(1));

        assert!(!graph.waits_on(op(1), op(2)));
        assert!(!graph.waits_on(op(3), op(1)));
        assert!(graph.waits_on(op(3), op(4)));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn no_cycle_in_dag() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(2), op(3));
        graph.add_edge(op(1), op(3));

        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn detects_two_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(2), op(1));

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.path, vec![op(1), op(2)]);
        assert_eq!(cycle.victim, op(2));
    }

    #[test]
    fn detects_three_cycle_with_last_waiter_as_victim() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(2), op(3));
        graph.add_edge(op(3), op(1));

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.path, vec![op(1), op(2), op(3)]);
        assert_eq!(cycle.victim, op(3));
    }

    #[test]
    fn cycle_path_excludes_lead_in_tail() {
        // 1 -> 2 -> 3 -> 2 has a tail before the cycle
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(2), op(3));
        graph.add_edge(op(3), op(2));

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.path, vec![op(2), op(3)]);
        assert_eq!(cycle.victim, op(3));
    }

    #[test]
    fn branches_are_explored_in_ascending_order() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(1), op(3));
        graph.add_edge(op(3), op(1));

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.path, vec![op(1), op(3)]);
        assert_eq!(cycle.victim, op(3));
    }

    #[test]
    fn finds_cycle_in_second_component() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(5), op(6));
        graph.add_edge(op(6), op(5));

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.path, vec![op(5), op(6)]);
        assert_eq!(cycle.victim, op(6));
    }

    #[test]
    fn breaking_the_cycle_clears_detection() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.add_edge(op(2), op(3));
        graph.add_edge(op(3), op(1));
        assert!(graph.find_cycle().is_some());

        graph.remove_operation(op(3));
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn large_chain_has_no_cycle() {
        let mut graph = WaitForGraph::new();
        for i in 0..500 {
            graph.add_edge(op(i), op(i + 1));
        }
        assert_eq!(graph.find_cycle(), None);
        assert_eq!(graph.edge_count(), 500);
    }

    #[test]
    fn clear_resets_everything() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(op(1), op(2));
        graph.clear();
        assert!(graph.is_empty());
        assert_eq!(graph.edge_count(), 0);
    }
}
