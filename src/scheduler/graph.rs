//! Dependency graph over task ids.
//!
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it
//!
//! Both maps are kept in sync. The graph is a derived view: it is rebuilt from
//! the store at startup and extended on every submission, never the source of
//! truth for task status.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use uuid::Uuid;

/// Dependency graph for tracking task dependencies.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    edges: HashMap<Uuid, BTreeSet<Uuid>>,
    reverse_edges: HashMap<Uuid, BTreeSet<Uuid>>,
}

impl DependencyGraph {
    /// Create an empty dependency graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(task, depends_on)` pairs.
    pub fn from_edges(edges: impl IntoIterator<Item = (Uuid, Uuid)>) -> Self {
        let mut graph = Self::new();
        for (task, depends_on) in edges {
            graph.add_dependency(task, depends_on);
        }
        graph
    }

    /// `task` waits for `depends_on`.
    pub fn add_dependency(&mut self, task: Uuid, depends_on: Uuid) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges.entry(depends_on).or_default().insert(task);
    }

    /// Register every dependency of a task.
    pub fn add_task(&mut self, task: Uuid, dependencies: impl IntoIterator<Item = Uuid>) {
        for dep in dependencies {
            self.add_dependency(task, dep);
        }
    }

    /// Tasks `task` waits for.
    pub fn dependencies(&self, task: Uuid) -> Vec<Uuid> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Tasks directly waiting on `task`.
    pub fn dependents(&self, task: Uuid) -> Vec<Uuid> {
        self.reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every task that directly or transitively waits on `task`, breadth-first.
    pub fn transitive_dependents(&self, task: Uuid) -> Vec<Uuid> {
        let mut seen = HashSet::from([task]);
        let mut queue = VecDeque::from([task]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            if let Some(waiting) = self.reverse_edges.get(&current) {
                for &next in waiting {
                    if seen.insert(next) {
                        out.push(next);
                        queue.push_back(next);
                    }
                }
            }
        }
        out
    }

    /// Number of tasks with at least one edge.
    pub fn len(&self) -> usize {
        self.edges
            .keys()
            .chain(self.reverse_edges.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty() && self.reverse_edges.is_empty()
    }

    /// Would giving `task` these dependencies close a cycle?
    ///
    /// Returns the cycle as `task -> ... -> task` if so. A cycle exists iff
    /// `task` is reachable from one of `dependencies` along forward edges.
    pub fn cycle_through(&self, task: Uuid, dependencies: &BTreeSet<Uuid>) -> Option<Vec<Uuid>> {
        for &start in dependencies {
            if start == task {
                return Some(vec![task, task]);
            }

            let mut parent: HashMap<Uuid, Uuid> = HashMap::new();
            let mut visited = HashSet::from([start]);
            let mut stack = vec![start];

            while let Some(node) = stack.pop() {
                for next in self.dependencies(node) {
                    if next == task {
                        let mut path = vec![task];
                        let mut hop = Some(node);
                        let mut back = Vec::new();
                        while let Some(n) = hop {
                            back.push(n);
                            hop = parent.get(&n).copied();
                        }
                        back.reverse();
                        path.extend(back);
                        path.push(task);
                        return Some(path);
                    }
                    if visited.insert(next) {
                        parent.insert(next, node);
                        stack.push(next);
                    }
                }
            }
        }
        None
    }

    /// Find any cycle already present in the graph.
    pub fn detect_cycle(&self) -> Option<Vec<Uuid>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            Gray,
            Black,
        }

        let mut color: HashMap<Uuid, Color> = HashMap::new();
        let mut roots: Vec<Uuid> = self.edges.keys().copied().collect();
        roots.sort();

        for root in roots {
            if color.contains_key(&root) {
                continue;
            }
            // (node, remaining deps) frames for an iterative DFS
            let mut path: Vec<Uuid> = Vec::new();
            let mut frames: Vec<(Uuid, Vec<Uuid>)> = vec![(root, self.dependencies(root))];
            color.insert(root, Color::Gray);
            path.push(root);

            while let Some((_, pending)) = frames.last_mut() {
                match pending.pop() {
                    Some(next) => match color.get(&next) {
                        Some(Color::Gray) => {
                            let start = path.iter().position(|n| *n == next).unwrap_or(0);
                            let mut cycle = path[start..].to_vec();
                            cycle.push(next);
                            return Some(cycle);
                        }
                        Some(Color::Black) => {}
                        None => {
                            color.insert(next, Color::Gray);
                            path.push(next);
                            frames.push((next, self.dependencies(next)));
                        }
                    },
                    None => {
                        if let Some((done, _)) = frames.pop() {
                            color.insert(done, Color::Black);
                            path.pop();
                        }
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn edges_stay_in_sync() {
        let t = ids(3);
        let mut g = DependencyGraph::new();
        g.add_dependency(t[1], t[0]);
        g.add_dependency(t[2], t[0]);

        assert_eq!(g.dependencies(t[1]), vec![t[0]]);
        let mut waiting = g.dependents(t[0]);
        waiting.sort();
        let mut expected = vec![t[1], t[2]];
        expected.sort();
        assert_eq!(waiting, expected);
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn transitive_dependents_walks_the_chain() {
        // a <- b <- c, a <- d
        let t = ids(4);
        let g = DependencyGraph::from_edges([(t[1], t[0]), (t[2], t[1]), (t[3], t[0])]);

        let all: HashSet<Uuid> = g.transitive_dependents(t[0]).into_iter().collect();
        assert_eq!(all, HashSet::from([t[1], t[2], t[3]]));
        assert_eq!(g.transitive_dependents(t[2]), Vec::<Uuid>::new());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let t = ids(1);
        let g = DependencyGraph::new();
        let cycle = g.cycle_through(t[0], &BTreeSet::from([t[0]])).unwrap();
        assert_eq!(cycle, vec![t[0], t[0]]);
    }

    #[test]
    fn closing_edge_reports_cycle_path() {
        // b -> a, c -> b; now a -> c closes a -> c -> b -> a
        let t = ids(3);
        let g = DependencyGraph::from_edges([(t[1], t[0]), (t[2], t[1])]);

        let cycle = g.cycle_through(t[0], &BTreeSet::from([t[2]])).unwrap();
        assert_eq!(cycle, vec![t[0], t[2], t[1], t[0]]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        // d waits on b and c, both wait on a
        let t = ids(4);
        let g = DependencyGraph::from_edges([(t[1], t[0]), (t[2], t[0])]);
        assert!(g.cycle_through(t[3], &BTreeSet::from([t[1], t[2]])).is_none());
        assert!(g.detect_cycle().is_none());
    }

    #[test]
    fn detect_existing_cycle() {
        let t = ids(3);
        let g = DependencyGraph::from_edges([(t[0], t[1]), (t[1], t[2]), (t[2], t[0])]);
        let cycle = g.detect_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }
}
