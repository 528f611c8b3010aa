//! Cascade Scheduler
//!
//! After an invalidation cascade the store recomputes the removed atoms that
//! still have subscribers, compares against their old values, and queues
//! notifications. The scheduler fixes the order of that work.
//!
//! # Algorithm
//!
//! A topological sort (Kahn's algorithm) over the removed atoms, counting only
//! edges that stay inside the removed set:
//!
//! 1. Count, for each removed atom, how many of its recorded dependencies were
//!    removed too.
//! 2. Seed a queue with atoms whose count is zero, in discovery order.
//! 3. Pop an atom, emit it, and decrement the count of its removed dependents.
//!
//! Dependencies are therefore recomputed before their dependents, and ties are
//! broken by the cascade's discovery order, which makes the result
//! deterministic for a given graph. The graph is acyclic by construction; if
//! an inconsistency ever leaves atoms unplaced they are appended in discovery
//! order instead of being dropped.

use std::collections::{HashMap, VecDeque};

use tracing::warn;

use super::cache::Invalidated;
use crate::reactive::AtomKey;

/// Order invalidated atoms so that dependencies precede dependents.
pub(crate) fn schedule(nodes: Vec<Invalidated>) -> Vec<Invalidated> {
    let count = nodes.len();
    if count < 2 {
        return nodes;
    }

    let index: HashMap<AtomKey, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.key, i))
        .collect();

    let mut in_degree = vec![0usize; count];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (i, node) in nodes.iter().enumerate() {
        for dependency in &node.dependencies {
            if let Some(&j) = index.get(dependency) {
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &dependent in &dependents[i] {
            in_degree[dependent] = in_degree[dependent].saturating_sub(1);
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() < count {
        warn!(
            placed = order.len(),
            total = count,
            "cycle among invalidated atoms, falling back to discovery order"
        );
        let mut placed = vec![false; count];
        for &i in &order {
            placed[i] = true;
        }
        order.extend((0..count).filter(|&i| !placed[i]));
    }

    let mut slots: Vec<Option<Invalidated>> = nodes.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexSet;
    use std::sync::Arc;

    fn node(raw: u64, deps: &[u64]) -> Invalidated {
        Invalidated {
            key: AtomKey::from_raw(raw),
            value: Some(Arc::new(()) as crate::reactive::Value),
            dependencies: deps
                .iter()
                .map(|d| AtomKey::from_raw(*d))
                .collect::<IndexSet<_>>(),
        }
    }

    fn keys(nodes: &[Invalidated]) -> Vec<u64> {
        nodes.iter().map(|n| n.key.raw()).collect()
    }

    #[test]
    fn dependencies_come_first() {
        // Discovered as 3, 2 but 3 reads 2.
        let ordered = schedule(vec![node(3, &[2]), node(2, &[1])]);
        assert_eq!(keys(&ordered), vec![2, 3]);
    }

    #[test]
    fn diamond_is_ordered_topologically() {
        // 1 -> {2, 3} -> 4, discovered worst-first.
        let ordered = schedule(vec![
            node(4, &[2, 3]),
            node(3, &[1]),
            node(2, &[1]),
            node(1, &[]),
        ]);
        let order = keys(&ordered);
        let pos = |k: u64| order.iter().position(|&x| x == k).unwrap();

        assert_eq!(order.len(), 4);
        assert!(pos(1) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(4));
        assert!(pos(3) < pos(4));
    }

    #[test]
    fn independent_nodes_keep_discovery_order() {
        let ordered = schedule(vec![node(9, &[]), node(5, &[]), node(7, &[])]);
        assert_eq!(keys(&ordered), vec![9, 5, 7]);
    }

    #[test]
    fn edges_outside_the_set_are_ignored() {
        let ordered = schedule(vec![node(2, &[100]), node(3, &[2, 101])]);
        assert_eq!(keys(&ordered), vec![2, 3]);
    }

    #[test]
    fn cycles_do_not_drop_nodes() {
        let ordered = schedule(vec![node(1, &[2]), node(2, &[1]), node(3, &[])]);
        assert_eq!(keys(&ordered), vec![3, 1, 2]);
    }
}
