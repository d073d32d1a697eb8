//! Module dependency graph.
//!
//! An edge `a -> b` means "a depends on b": `b` must be built first. The graph
//! is only mutated while modules claim their dependencies and is read-only
//! afterwards.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::Serialize;

use crate::contracts::ModuleId;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<ModuleId>,
    deps: HashMap<ModuleId, Vec<ModuleId>>,
    dependents: HashMap<ModuleId, Vec<ModuleId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: ModuleId) {
        if !self.deps.contains_key(&id) {
            self.nodes.push(id);
            self.deps.insert(id, Vec::new());
            self.dependents.insert(id, Vec::new());
        }
    }

    /// Record that `from` depends on `to`. Self-edges are dropped.
    /// Returns `true` if a new edge was added.
    pub fn add_edge(&mut self, from: ModuleId, to: ModuleId) -> bool {
        if from == to {
            return false;
        }
        self.add_node(from);
        self.add_node(to);

        let out = self.deps.entry(from).or_default();
        if out.contains(&to) {
            return false;
        }
        out.push(to);
        self.dependents.entry(to).or_default().push(from);
        true
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[ModuleId] {
        &self.nodes
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        self.deps.contains_key(&id)
    }

    pub fn edge_count(&self) -> usize {
        self.deps.values().map(Vec::len).sum()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: ModuleId) -> &[ModuleId] {
        self.deps.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Modules that directly depend on `id`.
    pub fn dependents_of(&self, id: ModuleId) -> &[ModuleId] {
        self.dependents.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Does `from` depend on `on`, directly or transitively?
    pub fn depends_on(&self, from: ModuleId, on: ModuleId) -> bool {
        self.transitive_dependencies(from).contains(&on)
    }

    /// Every module `id` depends on, in BFS order.
    pub fn transitive_dependencies(&self, id: ModuleId) -> Vec<ModuleId> {
        bfs(id, |n| self.dependencies_of(n))
    }

    /// Every module that depends on `id`, in BFS order over reverse edges.
    pub fn transitive_dependents(&self, id: ModuleId) -> Vec<ModuleId> {
        bfs(id, |n| self.dependents_of(n))
    }

    /// Cycles found by a depth-first walk with a recursion stack.
    ///
    /// Each back edge yields one path, from the first occurrence of the
    /// repeated node to the repeat (so the first and last entries match).
    pub fn cycles(&self) -> Vec<Vec<ModuleId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White, // unvisited
            Gray,  // on the current path
            Black, // finished
        }

        fn dfs(
            node: ModuleId,
            graph: &DependencyGraph,
            colors: &mut HashMap<ModuleId, Color>,
            path: &mut Vec<ModuleId>,
            found: &mut Vec<Vec<ModuleId>>,
        ) {
            colors.insert(node, Color::Gray);
            path.push(node);

            for &next in graph.dependencies_of(node) {
                match colors.get(&next).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        if let Some(start) = path.iter().position(|&n| n == next) {
                            let mut cycle = path[start..].to_vec();
                            cycle.push(next);
                            found.push(cycle);
                        }
                    }
                    Color::White => dfs(next, graph, colors, path, found),
                    Color::Black => {}
                }
            }

            path.pop();
            colors.insert(node, Color::Black);
        }

        let mut colors = HashMap::new();
        let mut path = Vec::new();
        let mut found = Vec::new();
        for &node in &self.nodes {
            if !colors.contains_key(&node) {
                dfs(node, self, &mut colors, &mut path, &mut found);
            }
        }
        found
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles().is_empty()
    }

    /// Shortest cycle passing through `id`, rendered `[id, .., id]`.
    pub fn find_cycle_through(&self, id: ModuleId) -> Option<Vec<ModuleId>> {
        let mut parent: HashMap<ModuleId, ModuleId> = HashMap::new();
        let mut visited: HashSet<ModuleId> = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            for &next in self.dependencies_of(current) {
                if next == id {
                    let mut path = vec![current];
                    let mut cursor = current;
                    while let Some(&p) = parent.get(&cursor) {
                        path.push(p);
                        cursor = p;
                    }
                    path.reverse();
                    if path.first() != Some(&id) {
                        path.insert(0, id);
                    }
                    path.push(id);
                    return Some(path);
                }
                if visited.insert(next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Every node that lies on at least one cycle.
    pub fn cyclic_nodes(&self) -> HashSet<ModuleId> {
        self.nodes
            .iter()
            .copied()
            .filter(|&n| self.find_cycle_through(n).is_some())
            .collect()
    }

    /// Dependencies-first order from a DFS post-order walk. Nodes on a cycle
    /// are left out.
    pub fn topological_order(&self) -> Vec<ModuleId> {
        fn visit(
            node: ModuleId,
            graph: &DependencyGraph,
            cyclic: &HashSet<ModuleId>,
            visited: &mut HashSet<ModuleId>,
            out: &mut Vec<ModuleId>,
        ) {
            if !visited.insert(node) {
                return;
            }
            for &dep in graph.dependencies_of(node) {
                if !cyclic.contains(&dep) {
                    visit(dep, graph, cyclic, visited, out);
                }
            }
            out.push(node);
        }

        let cyclic = self.cyclic_nodes();
        let mut visited = HashSet::new();
        let mut out = Vec::with_capacity(self.nodes.len());
        for &node in &self.nodes {
            if !cyclic.contains(&node) {
                visit(node, self, &cyclic, &mut visited, &mut out);
            }
        }
        out
    }

    /// Dependencies-first order where `key` breaks ties between modules that
    /// are ready at the same time (Kahn's algorithm over a min-heap).
    /// Nodes in `excluded` are left out and their edges ignored.
    pub fn schedule_by<K, F>(&self, excluded: &HashSet<ModuleId>, key: F) -> Vec<ModuleId>
    where
        K: Ord,
        F: Fn(ModuleId) -> K,
    {
        let included = |n: &ModuleId| !excluded.contains(n);

        let mut indeg: HashMap<ModuleId, usize> = HashMap::new();
        for &node in self.nodes.iter().filter(|n| included(n)) {
            let count = self
                .dependencies_of(node)
                .iter()
                .filter(|d| included(d))
                .count();
            indeg.insert(node, count);
        }

        let mut ready = BinaryHeap::new();
        for (&node, &degree) in &indeg {
            if degree == 0 {
                ready.push(Reverse((key(node), node)));
            }
        }

        let mut order = Vec::with_capacity(indeg.len());
        while let Some(Reverse((_, node))) = ready.pop() {
            order.push(node);
            for &dependent in self.dependents_of(node) {
                if let Some(degree) = indeg.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((key(dependent), dependent)));
                    }
                }
            }
        }
        order
    }

    pub fn dependency_info(&self, id: ModuleId) -> DependencyInfo {
        let cycle_path = self.find_cycle_through(id).unwrap_or_default();
        DependencyInfo {
            module: id,
            direct: self.dependencies_of(id).to_vec(),
            transitive: self.transitive_dependencies(id),
            dependents: self.dependents_of(id).to_vec(),
            is_part_of_cycle: !cycle_path.is_empty(),
            cycle_path,
        }
    }
}

fn bfs<'g, F>(start: ModuleId, next: F) -> Vec<ModuleId>
where
    F: Fn(ModuleId) -> &'g [ModuleId],
{
    let mut visited = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    let mut out = Vec::new();
    while let Some(current) = queue.pop_front() {
        for &n in next(current) {
            if visited.insert(n) {
                out.push(n);
                queue.push_back(n);
            }
        }
    }
    out
}

/// Dependency view of one module, as shown by diagnostics pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyInfo {
    pub module: ModuleId,
    pub direct: Vec<ModuleId>,
    /// All dependencies, direct ones included.
    pub transitive: Vec<ModuleId>,
    /// Modules that directly depend on this one.
    pub dependents: Vec<ModuleId>,
    pub cycle_path: Vec<ModuleId>,
    pub is_part_of_cycle: bool,
}

impl fmt::Display for DependencyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module {} dependencies:", self.module)?;
        if self.direct.is_empty() {
            write!(f, "\n  No direct dependencies")?;
        } else {
            write!(f, "\n  Direct dependencies: {}", join(&self.direct, ", "))?;
        }

        let indirect: Vec<ModuleId> = self
            .transitive
            .iter()
            .copied()
            .filter(|m| !self.direct.contains(m))
            .collect();
        if !indirect.is_empty() {
            write!(f, "\n  Transitive dependencies: {}", join(&indirect, ", "))?;
        }
        if !self.dependents.is_empty() {
            write!(f, "\n  Depended on by: {}", join(&self.dependents, ", "))?;
        }
        if self.is_part_of_cycle {
            write!(f, "\n  Part of dependency cycle: {}", join(&self.cycle_path, " -> "))?;
        }
        Ok(())
    }
}

pub(crate) fn join(ids: &[ModuleId], sep: &str) -> String {
    ids.iter().map(|m| m.name()).collect::<Vec<_>>().join(sep)
}
