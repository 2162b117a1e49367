//! Dependency graph over step ids
//!
//! Edges point from a consumer to its dependency: `connect(a, b)` records
//! that `a` needs `b` finished first. Adjacency and reverse adjacency are
//! kept in sync so both directions of traversal are O(edges).
//!
//! Uses Arc<str> ids, FxHashMap and SmallVec (most nodes have 0-4 deps).

mod walk;

pub use walk::{walk, StepOutcome, WalkReport};

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};
use smallvec::SmallVec;

use crate::error::{Result, StratusError};

/// Stack-allocated edge list: most nodes have 0-4 dependencies
pub type EdgeVec = SmallVec<[Arc<str>; 4]>;

#[derive(Clone, Default)]
pub struct Graph {
    /// node -> its dependencies
    deps: FxHashMap<Arc<str>, EdgeVec>,
    /// node -> nodes depending on it
    dependents: FxHashMap<Arc<str>, EdgeVec>,
    /// Insertion order; drives stable tie-breaking in the walker
    order: Vec<Arc<str>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex. Re-adding an existing vertex is a no-op.
    pub fn add(&mut self, id: impl AsRef<str>) -> Arc<str> {
        if let Some(existing) = self.lookup(id.as_ref()) {
            return existing;
        }
        let id: Arc<str> = Arc::from(id.as_ref());
        self.deps.insert(Arc::clone(&id), EdgeVec::new());
        self.dependents.insert(Arc::clone(&id), EdgeVec::new());
        self.order.push(Arc::clone(&id));
        id
    }

    fn lookup(&self, id: &str) -> Option<Arc<str>> {
        self.deps.get_key_value(id).map(|(k, _)| Arc::clone(k))
    }

    /// Record that `from` depends on `to`. Both vertices must exist.
    /// Self edges and duplicate edges are errors.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Err(StratusError::SelfEdge { node: from.into() });
        }
        let from = self
            .lookup(from)
            .ok_or_else(|| StratusError::UnknownNode { node: from.into() })?;
        let to = self
            .lookup(to)
            .ok_or_else(|| StratusError::UnknownNode { node: to.into() })?;

        let edges = self.deps.get_mut(&from).expect("vertex just looked up");
        if edges.iter().any(|d| *d == to) {
            return Err(StratusError::DuplicateEdge {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        edges.push(Arc::clone(&to));
        self.dependents.entry(to).or_default().push(from);
        Ok(())
    }

    /// Like connect, but an already-present edge is fine.
    ///
    /// The planner derives the same edge from `requires` and from an output
    /// reference without caring which came first.
    pub fn connect_idempotent(&mut self, from: &str, to: &str) -> Result<()> {
        match self.connect(from, to) {
            Err(StratusError::DuplicateEdge { .. }) => Ok(()),
            other => other,
        }
    }

    /// Drop a vertex and every incident edge.
    pub fn remove(&mut self, id: &str) {
        let Some(id) = self.lookup(id) else {
            return;
        };
        for dep in self.deps.remove(&id).unwrap_or_default() {
            if let Some(back) = self.dependents.get_mut(&dep) {
                back.retain(|n| *n != id);
            }
        }
        for dependent in self.dependents.remove(&id).unwrap_or_default() {
            if let Some(fwd) = self.deps.get_mut(&dependent) {
                fwd.retain(|n| *n != id);
            }
        }
        self.order.retain(|n| *n != id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.deps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Vertices in insertion order.
    pub fn nodes(&self) -> &[Arc<str>] {
        &self.order
    }

    /// Direct dependencies of a vertex.
    #[inline]
    pub fn dependencies(&self, id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.deps.get(id).map_or(EMPTY, SmallVec::as_slice)
    }

    /// Direct dependents of a vertex.
    #[inline]
    pub fn dependents(&self, id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.dependents.get(id).map_or(EMPTY, SmallVec::as_slice)
    }

    fn closure(&self, start: &str, reverse: bool) -> FxHashSet<Arc<str>> {
        let mut seen: FxHashSet<Arc<str>> = FxHashSet::default();
        let mut stack: Vec<Arc<str>> = match self.lookup(start) {
            Some(id) => vec![id],
            None => return seen,
        };
        while let Some(node) = stack.pop() {
            let next = if reverse {
                self.dependents(&node)
            } else {
                self.dependencies(&node)
            };
            for n in next {
                if seen.insert(Arc::clone(n)) {
                    stack.push(Arc::clone(n));
                }
            }
        }
        seen
    }

    /// Everything `id` transitively depends on (not including itself).
    pub fn transitive_deps(&self, id: &str) -> FxHashSet<Arc<str>> {
        self.closure(id, false)
    }

    /// Everything transitively depending on `id` (not including itself).
    pub fn transitive_dependents(&self, id: &str) -> FxHashSet<Arc<str>> {
        self.closure(id, true)
    }

    /// Subgraph of vertices matching the predicate, keeping edges whose
    /// endpoints both survive. Insertion order is preserved.
    pub fn filter(&self, mut keep: impl FnMut(&str) -> bool) -> Graph {
        let mut out = Graph::new();
        for node in &self.order {
            if keep(node) {
                out.add(node.as_ref());
            }
        }
        for node in out.order.clone() {
            for dep in self.dependencies(&node) {
                if out.contains(dep) {
                    // Edges were unique in self, so connect cannot collide
                    out.connect(&node, dep).expect("filtered edge");
                }
            }
        }
        out
    }

    /// Graph with every edge direction flipped (destroy ordering).
    pub fn inverted(&self) -> Graph {
        let mut out = Graph::new();
        for node in &self.order {
            out.add(node.as_ref());
        }
        for node in &self.order {
            for dep in self.dependencies(node) {
                out.connect(dep, node).expect("inverted edge");
            }
        }
        out
    }

    /// Detect cycles with three-color DFS, reporting every cycle found.
    ///
    /// White: unvisited. Gray: on the current DFS path. Black: finished.
    /// Hitting a gray node closes a cycle; the search continues so that
    /// disjoint cycles are all reported in one pass.
    pub fn validate(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: FxHashMap<Arc<str>, Color> = self
            .order
            .iter()
            .map(|id| (Arc::clone(id), Color::White))
            .collect();
        let mut stack: Vec<Arc<str>> = Vec::new();
        let mut cycles: Vec<String> = Vec::new();

        fn dfs(
            node: Arc<str>,
            deps: &FxHashMap<Arc<str>, EdgeVec>,
            colors: &mut FxHashMap<Arc<str>, Color>,
            stack: &mut Vec<Arc<str>>,
            cycles: &mut Vec<String>,
        ) {
            colors.insert(Arc::clone(&node), Color::Gray);
            stack.push(Arc::clone(&node));

            if let Some(neighbors) = deps.get(&node) {
                for neighbor in neighbors {
                    match colors.get(neighbor) {
                        Some(Color::Gray) => {
                            let start = stack
                                .iter()
                                .position(|x| x == neighbor)
                                .unwrap_or(0);
                            let mut path: Vec<&str> =
                                stack[start..].iter().map(|s| s.as_ref()).collect();
                            path.push(neighbor.as_ref());
                            cycles.push(path.join(" -> "));
                        }
                        Some(Color::White) | None => {
                            dfs(Arc::clone(neighbor), deps, colors, stack, cycles);
                        }
                        Some(Color::Black) => {}
                    }
                }
            }

            stack.pop();
            colors.insert(node, Color::Black);
        }

        for id in &self.order {
            if colors.get(id) == Some(&Color::White) {
                dfs(Arc::clone(id), &self.deps, &mut colors, &mut stack, &mut cycles);
            }
        }

        if cycles.is_empty() {
            Ok(())
        } else {
            Err(StratusError::CircularDependency { cycles })
        }
    }

    /// Drop edges implied by longer paths (a -> c is redundant when
    /// a -> b -> c exists). Used before rendering.
    pub fn transitive_reduction(&self) -> Graph {
        let mut out = Graph::new();
        for node in &self.order {
            out.add(node.as_ref());
        }
        for node in &self.order {
            let direct = self.dependencies(node);
            for dep in direct {
                // Redundant if some other direct dep already reaches it
                let implied = direct
                    .iter()
                    .filter(|d| *d != dep)
                    .any(|d| self.transitive_deps(d).contains(dep));
                if !implied {
                    out.connect(node, dep).expect("reduced edge");
                }
            }
        }
        out
    }

    /// Render as Graphviz dot. Edge direction matches `connect`:
    /// consumer -> dependency.
    pub fn dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for node in &self.order {
            out.push_str(&format!("  \"{}\";\n", node));
        }
        for node in &self.order {
            for dep in self.dependencies(node) {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", node, dep));
            }
        }
        out.push_str("}\n");
        out
    }

    /// Parse the output of [`Graph::dot`] back into a graph.
    pub fn from_dot(input: &str) -> Result<Graph> {
        let mut graph = Graph::new();
        for line in input.lines() {
            let line = line.trim().trim_end_matches(';');
            if line.is_empty() || line.starts_with("digraph") || line == "}" {
                continue;
            }
            if let Some((from, to)) = line.split_once("->") {
                let from = from.trim().trim_matches('"').to_string();
                let to = to.trim().trim_matches('"').to_string();
                graph.add(&from);
                graph.add(&to);
                graph.connect_idempotent(&from, &to)?;
            } else {
                graph.add(line.trim_matches('"'));
            }
        }
        Ok(graph)
    }

    /// Adjacency-map JSON: `{node: [deps...]}`, nodes in insertion order.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for node in &self.order {
            let deps: Vec<Value> = self
                .dependencies(node)
                .iter()
                .map(|d| json!(d.as_ref()))
                .collect();
            map.insert(node.to_string(), Value::Array(deps));
        }
        Value::Object(map)
    }

    /// Edge set as (from, to) pairs, for comparisons in tests and diffs.
    pub fn edge_set(&self) -> FxHashSet<(String, String)> {
        let mut set = FxHashSet::default();
        for node in &self.order {
            for dep in self.dependencies(node) {
                set.insert((node.to_string(), dep.to_string()));
            }
        }
        set
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for node in &self.order {
            map.entry(&node.as_ref(), &self.dependencies(node));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> Graph {
        let mut g = Graph::new();
        for n in names {
            g.add(*n);
        }
        for pair in names.windows(2) {
            // later depends on earlier
            g.connect(pair[1], pair[0]).unwrap();
        }
        g
    }

    // ═══════════════════════════════════════════════════════════════
    // CONSTRUCTION
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn add_is_idempotent() {
        let mut g = Graph::new();
        g.add("vpc");
        g.add("vpc");
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn self_edge_is_error() {
        let mut g = Graph::new();
        g.add("vpc");
        let err = g.connect("vpc", "vpc").unwrap_err();
        assert!(err.to_string().contains("STRA-022"));
    }

    #[test]
    fn duplicate_edge_is_error() {
        let mut g = chain(&["a", "b"]);
        let err = g.connect("b", "a").unwrap_err();
        assert!(err.to_string().contains("STRA-021"));
        // but the idempotent variant accepts it
        g.connect_idempotent("b", "a").unwrap();
    }

    #[test]
    fn unknown_node_is_error() {
        let mut g = Graph::new();
        g.add("a");
        assert!(g.connect("a", "ghost").is_err());
    }

    #[test]
    fn remove_drops_incident_edges() {
        let mut g = chain(&["a", "b", "c"]);
        g.remove("b");
        assert!(!g.contains("b"));
        assert!(g.dependencies("c").is_empty());
        assert!(g.dependents("a").is_empty());
    }

    // ═══════════════════════════════════════════════════════════════
    // CYCLE DETECTION
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn linear_is_acyclic() {
        assert!(chain(&["a", "b", "c"]).validate().is_ok());
    }

    #[test]
    fn detects_simple_cycle() {
        let mut g = chain(&["a", "b", "c"]);
        g.connect("a", "c").unwrap();
        let err = g.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("STRA-020"));
        assert!(msg.contains("->"));
    }

    #[test]
    fn reports_all_disjoint_cycles() {
        let mut g = Graph::new();
        for n in ["a", "b", "c", "d"] {
            g.add(n);
        }
        g.connect("a", "b").unwrap();
        g.connect("b", "a").unwrap();
        g.connect("c", "d").unwrap();
        g.connect("d", "c").unwrap();

        match g.validate() {
            Err(StratusError::CircularDependency { cycles }) => {
                assert_eq!(cycles.len(), 2, "both cycles reported: {:?}", cycles);
            }
            other => panic!("expected CircularDependency, got {:?}", other.err()),
        }
    }

    #[test]
    fn diamond_is_acyclic() {
        let mut g = Graph::new();
        for n in ["a", "b", "c", "d"] {
            g.add(n);
        }
        g.connect("b", "a").unwrap();
        g.connect("c", "a").unwrap();
        g.connect("d", "b").unwrap();
        g.connect("d", "c").unwrap();
        assert!(g.validate().is_ok());
    }

    // ═══════════════════════════════════════════════════════════════
    // TRAVERSAL
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn transitive_deps_closure() {
        let g = chain(&["a", "b", "c"]);
        let deps = g.transitive_deps("c");
        assert_eq!(deps.len(), 2);
        assert!(deps.contains("a") && deps.contains("b"));
        assert!(g.transitive_deps("a").is_empty());
    }

    #[test]
    fn transitive_dependents_closure() {
        let g = chain(&["a", "b", "c"]);
        let deps = g.transitive_dependents("a");
        assert_eq!(deps.len(), 2);
        assert!(deps.contains("b") && deps.contains("c"));
    }

    #[test]
    fn filter_keeps_inner_edges() {
        let g = chain(&["a", "b", "c"]);
        let sub = g.filter(|n| n != "c");
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.dependencies("b"), g.dependencies("b"));
        assert!(!sub.contains("c"));
    }

    #[test]
    fn inverted_flips_edges() {
        let g = chain(&["a", "b"]);
        let inv = g.inverted();
        assert_eq!(inv.dependencies("a").len(), 1);
        assert!(inv.dependencies("b").is_empty());
    }

    // ═══════════════════════════════════════════════════════════════
    // REDUCTION & SERIALIZATION
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn reduction_drops_implied_edge() {
        let mut g = chain(&["a", "b", "c"]);
        g.connect("c", "a").unwrap(); // implied by c -> b -> a
        let reduced = g.transitive_reduction();
        assert!(!reduced.edge_set().contains(&("c".into(), "a".into())));
        assert!(reduced.edge_set().contains(&("c".into(), "b".into())));
        assert!(reduced.edge_set().contains(&("b".into(), "a".into())));
    }

    #[test]
    fn dot_round_trip_preserves_edges() {
        let mut g = chain(&["a", "b", "c"]);
        g.add("lonely");
        let parsed = Graph::from_dot(&g.dot()).unwrap();
        assert_eq!(parsed.edge_set(), g.edge_set());
        assert!(parsed.contains("lonely"));
    }

    #[test]
    fn json_adjacency_shape() {
        let g = chain(&["a", "b"]);
        let json = g.to_json();
        assert_eq!(json["b"][0], "a");
        assert_eq!(json["a"].as_array().unwrap().len(), 0);
    }
}
