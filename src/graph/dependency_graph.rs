//! Dependency relations for the live task graph.
//!
//! The graph is held as two inverse adjacency maps, `dependencies` and
//! `dependents`, derived once per key at admission and never mutated
//! afterwards. Keys that leave the computation are handled by the frontier
//! sets, not by edge removal, so both maps only ever grow with the graph.

use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::graph::Key;

/// The two inverse adjacency maps of the task graph.
///
/// `dependencies[k]` is the set of keys `k` consumes; `dependents[k]` is its
/// exact transpose. Every admitted key has an entry in both maps, possibly
/// empty.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: HashMap<Key, HashSet<Key>>,
    dependents: HashMap<Key, HashSet<Key>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly admitted key and its dependency set. A key that is
    /// already present keeps its original edges.
    pub fn add_task(&mut self, key: &Key, deps: HashSet<Key>) {
        if self.dependencies.contains_key(key) {
            return;
        }
        for dep in &deps {
            self.dependents.entry(dep.clone()).or_default().insert(key.clone());
        }
        self.dependents.entry(key.clone()).or_default();
        self.dependencies.insert(key.clone(), deps);
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.dependencies.contains_key(key)
    }

    pub fn dependencies(&self) -> &HashMap<Key, HashSet<Key>> {
        &self.dependencies
    }

    pub fn dependents(&self) -> &HashMap<Key, HashSet<Key>> {
        &self.dependents
    }

    pub fn dependencies_of(&self, key: &Key) -> Option<&HashSet<Key>> {
        self.dependencies.get(key)
    }

    pub fn dependents_of(&self, key: &Key) -> Option<&HashSet<Key>> {
        self.dependents.get(key)
    }

    /// All keys required by `keys` that lie outside `frontier`.
    ///
    /// Reverse depth-first search from the requested outputs, pruning at any
    /// key that is already in play. Only keys outside the frontier need
    /// fresh `waiting` entries at admission.
    pub fn keys_outside_frontier(
        &self,
        keys: &HashSet<Key>,
        frontier: &HashSet<Key>,
    ) -> HashSet<Key> {
        let mut stack: Vec<Key> = keys.difference(frontier).cloned().collect();
        let mut result = HashSet::new();
        while let Some(key) = stack.pop() {
            if result.contains(&key) || frontier.contains(&key) {
                continue;
            }
            if let Some(deps) = self.dependencies.get(&key) {
                stack.extend(deps.iter().cloned());
            }
            result.insert(key);
        }
        result
    }
}

/// Topological rank of every key in `keys`, considering only edges between
/// keys of the set. Kahn's algorithm with a lexicographic tie-break so the
/// ranking is deterministic. Returns `None` if the subgraph has a cycle.
pub fn topological_ranks(
    keys: &HashSet<Key>,
    dependencies: &HashMap<Key, HashSet<Key>>,
) -> Option<HashMap<Key, usize>> {
    let mut indegree: HashMap<&Key, usize> = HashMap::with_capacity(keys.len());
    let mut dependents: HashMap<&Key, Vec<&Key>> = HashMap::new();
    for key in keys {
        let deps = dependencies.get(key);
        let local: Vec<&Key> = deps
            .map(|d| d.iter().filter(|dep| keys.contains(*dep)).collect())
            .unwrap_or_default();
        indegree.insert(key, local.len());
        for dep in local {
            dependents.entry(dep).or_default().push(key);
        }
    }

    // min-heap on the key text keeps equal-depth keys in a stable order
    let mut ready: BinaryHeap<std::cmp::Reverse<&Key>> = indegree
        .iter()
        .filter(|&(_, &n)| n == 0)
        .map(|(k, _)| std::cmp::Reverse(*k))
        .collect();

    let mut ranks = HashMap::with_capacity(keys.len());
    let mut rank = 0usize;
    while let Some(std::cmp::Reverse(key)) = ready.pop() {
        ranks.insert(key.clone(), rank);
        rank += 1;
        if let Some(deps) = dependents.get(key) {
            for dependent in deps {
                let n = indegree.get_mut(dependent).expect("seeded above");
                *n -= 1;
                if *n == 0 {
                    ready.push(std::cmp::Reverse(*dependent));
                }
            }
        }
    }

    if ranks.len() == keys.len() {
        Some(ranks)
    } else {
        None // cycle
    }
}
