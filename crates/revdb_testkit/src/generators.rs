//! Proptest strategies.

use proptest::prelude::*;

/// Object graphs over `nodes` objects: each state lists, per object, the
/// indexes of the objects it links to. The root always has index 0.
#[derive(Debug, Clone)]
pub struct GraphHistory {
    /// Number of objects, root included.
    pub nodes: usize,
    /// Successive link states of the whole graph.
    pub states: Vec<Vec<Vec<usize>>>,
}

impl GraphHistory {
    /// Indexes reachable from the root in state `at`.
    pub fn reachable(&self, at: usize) -> Vec<bool> {
        let links = &self.states[at];
        let mut seen = vec![false; self.nodes];
        let mut pending = vec![0];
        while let Some(node) = pending.pop() {
            if std::mem::replace(&mut seen[node], true) {
                continue;
            }
            pending.extend(links[node].iter().copied());
        }
        seen
    }
}

fn graph_state(nodes: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    prop::collection::vec(prop::collection::vec(0..nodes, 0..3), nodes)
}

/// Histories of 2 to 8 objects and 1 to 5 graph states.
pub fn graph_history_strategy() -> impl Strategy<Value = GraphHistory> {
    (2usize..8).prop_flat_map(|nodes| {
        prop::collection::vec(graph_state(nodes), 1..5)
            .prop_map(move |states| GraphHistory { nodes, states })
    })
}

/// A sequence of writes: `(object index, new value)` per transaction,
/// over `objects` objects.
pub fn write_history_strategy(
    objects: usize,
) -> impl Strategy<Value = Vec<Vec<(usize, i64)>>> {
    prop::collection::vec(
        prop::collection::vec((0..objects, -1000i64..1000), 1..4),
        1..8,
    )
}

/// Storage names usable as jar sort keys.
pub fn jar_names_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z]{1,6}", 2..5).prop_map(|names| names.into_iter().collect())
}
