//! Immutable dependency graph over the process catalog

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::core::Config;

/// Dependency graph built once from the catalog and never mutated.
///
/// Edge `A -> B` means A depends on B. `forward` maps a process to its
/// dependencies, `reverse` maps a process to its dependents. BTree containers
/// make every traversal deterministic, so independent processes always come
/// out in name order.
#[derive(Debug)]
pub struct DependencyGraph {
    forward: BTreeMap<String, Vec<String>>,
    reverse: BTreeMap<String, Vec<String>>,
    nodes: BTreeSet<String>,
}

impl DependencyGraph {
    pub fn new(config: &Config) -> Self {
        let mut forward: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut reverse: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut nodes = BTreeSet::new();

        for (name, proc) in &config.processes {
            nodes.insert(name.clone());
            forward.insert(name.clone(), proc.depends_on.clone());
            for dep in &proc.depends_on {
                reverse.entry(dep.clone()).or_default().push(name.clone());
            }
        }

        Self {
            forward,
            reverse,
            nodes,
        }
    }

    /// Check for cycles with Kahn's algorithm. When fewer nodes drain than
    /// exist, the ones with residual in-degree are the witness set.
    pub fn validate(&self) -> Result<()> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for name in &self.nodes {
            in_degree.insert(name, self.deps_of(name).len());
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for dependent in self.dependents_of(node) {
                let deg = in_degree.entry(dependent).or_default();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited != self.nodes.len() {
            let cycle_nodes: Vec<&str> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(anyhow!(
                "dependency cycle detected involving: {}",
                cycle_nodes.join(", ")
            ));
        }
        Ok(())
    }

    /// Topological order of the targets plus all their transitive
    /// dependencies. Dependencies come first. Fails on unknown targets.
    pub fn start_order(&self, targets: &[String]) -> Result<Vec<String>> {
        // Closure of the targets under forward edges.
        let mut required = BTreeSet::new();
        for target in targets {
            if !self.nodes.contains(target) {
                return Err(anyhow!("unknown process: {}", target));
            }
            self.collect_closure(target, &self.forward, &mut required);
        }

        // Kahn over the required subgraph only.
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for name in &required {
            let count = self
                .deps_of(name)
                .iter()
                .filter(|dep| required.contains(*dep))
                .count();
            in_degree.insert(name, count);
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(required.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            for dependent in self.dependents_of(node) {
                if !required.contains(dependent) {
                    continue;
                }
                let deg = in_degree.entry(dependent).or_default();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != required.len() {
            return Err(anyhow!("dependency cycle detected"));
        }
        Ok(order)
    }

    /// Reverse of `start_order`: dependents come before their dependencies,
    /// so they can be stopped first.
    pub fn stop_order(&self, targets: &[String]) -> Result<Vec<String>> {
        let mut order = self.start_order(targets)?;
        order.reverse();
        Ok(order)
    }

    /// Every process that directly or transitively depends on `name`.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let mut result = BTreeSet::new();
        self.collect_closure(name, &self.reverse, &mut result);
        result.remove(name);
        result.into_iter().collect()
    }

    /// Every process `name` directly or transitively depends on.
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        let mut result = BTreeSet::new();
        self.collect_closure(name, &self.forward, &mut result);
        result.remove(name);
        result.into_iter().collect()
    }

    fn collect_closure(
        &self,
        start: &str,
        edges: &BTreeMap<String, Vec<String>>,
        out: &mut BTreeSet<String>,
    ) {
        if !out.insert(start.to_string()) {
            return;
        }
        for next in edges.get(start).map(|v| v.as_slice()).unwrap_or(&[]) {
            self.collect_closure(next, edges, out);
        }
    }

    fn deps_of(&self, name: &str) -> &[String] {
        self.forward.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn dependents_of(&self, name: &str) -> &[String] {
        self.reverse.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Process;

    fn build_graph(procs: &[(&str, &[&str])]) -> DependencyGraph {
        let mut config = Config::default();
        for (name, deps) in procs {
            config.processes.insert(
                name.to_string(),
                Process {
                    command: format!("echo {}", name),
                    depends_on: deps.iter().map(|d| d.to_string()).collect(),
                    ..Default::default()
                },
            );
        }
        DependencyGraph::new(&config)
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn linear_chain_order() {
        // A depends on B, B depends on C.
        let g = build_graph(&[("A", &["B"]), ("B", &["C"]), ("C", &[])]);

        g.validate().unwrap();
        let order = g.start_order(&names(&["A"])).unwrap();
        assert_eq!(order, names(&["C", "B", "A"]));
    }

    #[test]
    fn diamond_order() {
        // D depends on B and C, both depend on A.
        let g = build_graph(&[
            ("A", &[]),
            ("B", &["A"]),
            ("C", &["A"]),
            ("D", &["B", "C"]),
        ]);

        g.validate().unwrap();
        let order = g.start_order(&names(&["D"])).unwrap();

        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "A");
        assert_eq!(order[3], "D");
        let mut middle = order[1..3].to_vec();
        middle.sort();
        assert_eq!(middle, names(&["B", "C"]));
    }

    #[test]
    fn cycle_detected() {
        let g = build_graph(&[("A", &["C"]), ("B", &["A"]), ("C", &["B"])]);

        let err = g.validate().unwrap_err();
        assert!(err.to_string().contains("dependency cycle detected"));
    }

    #[test]
    fn cycle_witness_names_nodes() {
        // D is acyclic, A/B/C form the cycle.
        let g = build_graph(&[("A", &["C"]), ("B", &["A"]), ("C", &["B"]), ("D", &[])]);

        let err = g.validate().unwrap_err().to_string();
        assert!(err.contains("A") && err.contains("B") && err.contains("C"));
        assert!(!err.contains("D"));
    }

    #[test]
    fn self_cycle_detected() {
        let g = build_graph(&[("A", &["A"])]);
        assert!(g.validate().is_err());
    }

    #[test]
    fn independent_nodes_sorted_by_name() {
        let g = build_graph(&[("C", &[]), ("A", &[]), ("B", &[])]);

        g.validate().unwrap();
        let order = g.start_order(&names(&["C", "A", "B"])).unwrap();
        assert_eq!(order, names(&["A", "B", "C"]));
    }

    #[test]
    fn disconnected_components() {
        // Two independent chains: A->B, C->D.
        let g = build_graph(&[("A", &["B"]), ("B", &[]), ("C", &["D"]), ("D", &[])]);

        let order = g.start_order(&names(&["A"])).unwrap();
        assert_eq!(order, names(&["B", "A"]));

        let order = g.start_order(&names(&["A", "C"])).unwrap();
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn target_closure_includes_deps() {
        let g = build_graph(&[("A", &[]), ("B", &["A"]), ("C", &[])]);

        let order = g.start_order(&names(&["B"])).unwrap();
        assert_eq!(order, names(&["A", "B"]));
    }

    #[test]
    fn unknown_target_rejected() {
        let g = build_graph(&[("A", &[])]);

        let err = g.start_order(&names(&["nonexistent"])).unwrap_err();
        assert!(err.to_string().contains("unknown process"));
    }

    #[test]
    fn stop_order_is_reverse_of_start_order() {
        let g = build_graph(&[("A", &["B"]), ("B", &["C"]), ("C", &[])]);

        let start = g.start_order(&names(&["A"])).unwrap();
        let stop = g.stop_order(&names(&["A"])).unwrap();

        assert_eq!(stop, names(&["A", "B", "C"]));
        let mut reversed = start.clone();
        reversed.reverse();
        assert_eq!(stop, reversed);
    }

    #[test]
    fn direct_dependents() {
        let g = build_graph(&[("A", &[]), ("B", &["A"]), ("C", &["A"])]);

        assert_eq!(g.dependents("A"), names(&["B", "C"]));
    }

    #[test]
    fn transitive_dependents() {
        let g = build_graph(&[("A", &[]), ("B", &["A"]), ("C", &["B"])]);

        assert_eq!(g.dependents("A"), names(&["B", "C"]));
        assert!(g.dependents("C").is_empty());
    }

    #[test]
    fn transitive_dependencies() {
        let g = build_graph(&[("A", &[]), ("B", &["A"]), ("C", &["B"])]);

        assert_eq!(g.dependencies("C"), names(&["A", "B"]));
        assert!(g.dependencies("A").is_empty());
    }

    #[test]
    fn dependents_and_dependencies_are_duals() {
        let g = build_graph(&[
            ("A", &[]),
            ("B", &["A"]),
            ("C", &["A"]),
            ("D", &["B", "C"]),
        ]);

        for x in ["A", "B", "C", "D"] {
            for y in ["A", "B", "C", "D"] {
                let y_depends_on_x = g.dependents(x).contains(&y.to_string());
                let x_required_by_y = g.dependencies(y).contains(&x.to_string());
                assert_eq!(y_depends_on_x, x_required_by_y, "x={} y={}", x, y);
            }
        }
    }

    #[test]
    fn single_node_order() {
        let g = build_graph(&[("A", &[])]);

        let order = g.start_order(&names(&["A"])).unwrap();
        assert_eq!(order, names(&["A"]));
    }
}
