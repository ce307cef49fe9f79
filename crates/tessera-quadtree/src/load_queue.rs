//! Pending load requests ordered by visual importance.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;

use crate::node::NodeId;

/// Factors that determine a pending load's priority.
#[derive(Clone, Copy, Debug)]
pub struct LoadPriorityFactors {
    /// Distance from the viewer to the nearest point of the node.
    pub distance: f32,
    /// Levels the rendered surface over this node lags its ideal depth.
    pub lag: u8,
}

/// Higher scores are issued first: lagging regions, then nearer ones.
#[must_use]
pub fn compute_priority(factors: &LoadPriorityFactors) -> f64 {
    let distance = f64::from(factors.distance).max(1.0);
    f64::from(factors.lag) * 1_000.0 + 1_000.0 / distance
}

#[derive(Clone, Debug)]
struct QueueEntry {
    node: NodeId,
    priority: f64,
    /// Entries whose generation no longer matches the map are stale.
    generation: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            // Older entries first among equals.
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

/// Max-priority queue of nodes awaiting a load slot.
///
/// Re-pushing a node updates its priority; superseded heap entries are
/// skipped lazily on pop.
#[derive(Default)]
pub struct LoadQueue {
    heap: BinaryHeap<QueueEntry>,
    generations: FxHashMap<NodeId, u64>,
    next_generation: u64,
}

impl LoadQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node or update its priority.
    pub fn push(&mut self, node: NodeId, priority: f64) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.generations.insert(node, generation);
        self.heap.push(QueueEntry {
            node,
            priority,
            generation,
        });
    }

    /// Remove and return the highest-priority node.
    pub fn pop(&mut self) -> Option<(NodeId, f64)> {
        while let Some(entry) = self.heap.pop() {
            if self.generations.get(&entry.node) == Some(&entry.generation) {
                self.generations.remove(&entry.node);
                return Some((entry.node, entry.priority));
            }
        }
        None
    }

    /// Drop a node from the queue. Returns whether it was queued.
    pub fn remove(&mut self, node: NodeId) -> bool {
        self.generations.remove(&node).is_some()
    }

    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.generations.contains_key(&node)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.generations.clear();
    }
}
