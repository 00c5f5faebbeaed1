//! Topological ordering of dependency graphs.
//!
//! The resolver turns any [`DependencyGraph`] into a provisioning plan in
//! which every dependency precedes its dependents, and detects cycles.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{GraphError, Result};
use crate::graph::DependencyGraph;

/// Resolves dependency graphs into deterministic provisioning plans.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanResolver;

/// Ordered list of node ids, every dependency before its dependents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProvisioningPlan {
    order: Vec<String>,
}

/// DFS visit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl PlanResolver {
    /// Creates a new resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Orders the graph topologically.
    ///
    /// Nodes are visited in insertion order and dependencies in declaration
    /// order, so identical graphs always yield identical plans. Dependencies
    /// on ids the graph does not contain are ignored.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` with the ids on the cycle, in path order,
    /// the first id repeated at the end.
    pub fn resolve<G: DependencyGraph + ?Sized>(&self, graph: &G) -> Result<ProvisioningPlan> {
        let ids = graph.node_ids();
        let known: HashSet<&str> = ids.iter().copied().collect();
        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(ids.len());
        let mut path: Vec<&str> = Vec::new();
        let mut order: Vec<String> = Vec::with_capacity(ids.len());

        for &id in &ids {
            Self::visit(graph, id, &known, &mut marks, &mut path, &mut order)?;
        }

        Ok(ProvisioningPlan { order })
    }

    /// Returns the teardown order: exactly the reverse of `plan`.
    #[must_use]
    pub fn reverse(&self, plan: &ProvisioningPlan) -> ProvisioningPlan {
        ProvisioningPlan {
            order: plan.order.iter().rev().cloned().collect(),
        }
    }

    fn visit<'g, G: DependencyGraph + ?Sized>(
        graph: &'g G,
        id: &'g str,
        known: &HashSet<&str>,
        marks: &mut HashMap<&'g str, Mark>,
        path: &mut Vec<&'g str>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|p| (*p).to_string()).collect();
                cycle.push(id.to_string());
                return Err(GraphError::CyclicDependency { cycle }.into());
            }
            None => {}
        }

        marks.insert(id, Mark::InProgress);
        path.push(id);

        for dep in graph.dependencies(id) {
            if known.contains(dep) {
                Self::visit(graph, dep, known, marks, path, order)?;
            }
        }

        path.pop();
        marks.insert(id, Mark::Done);
        order.push(id.to_string());
        Ok(())
    }
}

impl ProvisioningPlan {
    /// Node ids in plan order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Iterates over node ids in plan order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Position of `id` in the plan.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }

    /// Number of nodes in the plan.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the plan has no nodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl fmt::Display for ProvisioningPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.order.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackplanError;

    /// Adjacency list in insertion order.
    struct Edges(Vec<(&'static str, Vec<&'static str>)>);

    impl DependencyGraph for Edges {
        fn node_ids(&self) -> Vec<&str> {
            self.0.iter().map(|(id, _)| *id).collect()
        }

        fn dependencies(&self, id: &str) -> Vec<&str> {
            self.0
                .iter()
                .find(|(n, _)| *n == id)
                .map(|(_, deps)| deps.clone())
                .unwrap_or_default()
        }
    }

    fn assert_respects_edges(graph: &Edges, plan: &ProvisioningPlan) {
        for (id, deps) in &graph.0 {
            for dep in deps {
                assert!(plan.position(dep) < plan.position(id), "{dep} must precede {id}");
            }
        }
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let graph = Edges(vec![
            ("service", vec!["task", "listener"]),
            ("listener", vec!["lb", "tg"]),
            ("task", vec!["ap", "role"]),
            ("ap", vec!["fs"]),
            ("fs", vec!["vpc"]),
            ("lb", vec!["vpc"]),
            ("tg", vec!["vpc"]),
            ("role", vec![]),
            ("vpc", vec![]),
        ]);

        let plan = PlanResolver::new().resolve(&graph).unwrap();
        assert_eq!(plan.len(), 9);
        assert_respects_edges(&graph, &plan);
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let graph = Edges(vec![("b", vec![]), ("a", vec![]), ("c", vec!["a", "b"])]);
        let plan = PlanResolver::new().resolve(&graph).unwrap();
        assert_eq!(plan.ids(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let build = || Edges(vec![("x", vec!["z", "y"]), ("y", vec![]), ("z", vec!["y"])]);
        let resolver = PlanResolver::new();
        let first = resolver.resolve(&build()).unwrap();
        let second = resolver.resolve(&build()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.ids(), vec!["y", "z", "x"]);
    }

    #[test]
    fn test_cycle_names_participants() {
        let graph = Edges(vec![("a", vec!["b"]), ("b", vec!["c"]), ("c", vec!["a"]), ("d", vec![])]);
        let err = PlanResolver::new().resolve(&graph).unwrap_err();

        match err {
            StackplanError::Graph(GraphError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let graph = Edges(vec![("a", vec!["a"])]);
        assert!(PlanResolver::new().resolve(&graph).is_err());
    }

    #[test]
    fn test_reverse_is_exact_inverse() {
        let graph = Edges(vec![("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"]), ("d", vec![])]);
        let resolver = PlanResolver::new();
        let plan = resolver.resolve(&graph).unwrap();
        let reversed = resolver.reverse(&plan);

        let mut expected = plan.ids();
        expected.reverse();
        assert_eq!(reversed.ids(), expected);
        assert_eq!(resolver.reverse(&reversed), plan);
    }

    #[test]
    fn test_unknown_dependencies_ignored() {
        let graph = Edges(vec![("a", vec!["gone"])]);
        let plan = PlanResolver::new().resolve(&graph).unwrap();
        assert_eq!(plan.to_string(), "a");
    }
}
