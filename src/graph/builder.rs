//! Dependency graph construction.
//!
//! The builder collects the nodes of one deployment unit, then turns the
//! references found in their attributes into explicit dependency edges.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::{GraphError, Result};

use super::node::ResourceNode;
use super::DependencyGraph;

/// Collects resource nodes and materializes their dependency edges.
#[derive(Debug)]
pub struct GraphBuilder {
    /// Unit the nodes belong to.
    unit: String,
    /// Cross-unit input names the unit declares.
    inputs: BTreeSet<String>,
    /// Nodes in insertion order.
    nodes: Vec<ResourceNode>,
    /// Node id to position in `nodes`.
    index: HashMap<String, usize>,
}

/// The resolved dependency graph of one deployment unit.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Unit the graph belongs to.
    unit: String,
    /// Declared cross-unit input names.
    inputs: BTreeSet<String>,
    /// Nodes in insertion order, with `depends_on` populated.
    nodes: Vec<ResourceNode>,
    /// Node id to position in `nodes`.
    index: HashMap<String, usize>,
}

impl GraphBuilder {
    /// Creates an empty builder for `unit`.
    #[must_use]
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            inputs: BTreeSet::new(),
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Declares the cross-unit input names nodes may reference.
    #[must_use]
    pub fn with_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(names.into_iter().map(Into::into));
        self
    }

    /// Adds a node to the unit.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if a node with the same id was already added.
    pub fn add_node(&mut self, node: ResourceNode) -> Result<()> {
        if self.index.contains_key(&node.id) {
            return Err(GraphError::DuplicateId {
                unit: self.unit.clone(),
                id: node.id,
            }
            .into());
        }

        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Number of nodes added so far.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no nodes were added.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Scans attributes for references and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedReference` if a node references an id that is not
    /// part of the unit, or an input the unit does not declare.
    pub fn build(mut self) -> Result<ResourceGraph> {
        for node in &mut self.nodes {
            for dep in &node.depends_on {
                if !self.index.contains_key(dep) {
                    return Err(unresolved(&self.unit, &node.id, dep.clone()));
                }
            }

            let mut referenced: Vec<String> = Vec::new();
            for value in node.attributes.values() {
                for r in value.references() {
                    if !self.index.contains_key(&r.node) {
                        return Err(unresolved(&self.unit, &node.id, r.to_string()));
                    }
                    referenced.push(r.node.clone());
                }
                for input in value.inputs() {
                    if !self.inputs.contains(input) {
                        return Err(unresolved(&self.unit, &node.id, format!("input:{input}")));
                    }
                }
            }

            for id in referenced {
                if !node.depends_on.contains(&id) {
                    node.depends_on.push(id);
                }
            }
        }

        debug!(
            "Built graph for unit '{}' with {} nodes and {} edges",
            self.unit,
            self.nodes.len(),
            self.nodes.iter().map(|n| n.depends_on.len()).sum::<usize>()
        );

        Ok(ResourceGraph {
            unit: self.unit,
            inputs: self.inputs,
            nodes: self.nodes,
            index: self.index,
        })
    }
}

fn unresolved(unit: &str, node: &str, reference: String) -> crate::error::StackplanError {
    GraphError::UnresolvedReference {
        unit: unit.to_string(),
        node: node.to_string(),
        reference,
    }
    .into()
}

impl ResourceGraph {
    /// Builds a graph from nodes in one step.
    ///
    /// # Errors
    ///
    /// Returns the first builder error encountered.
    pub fn from_nodes(unit: &str, nodes: impl IntoIterator<Item = ResourceNode>) -> Result<Self> {
        let mut builder = GraphBuilder::new(unit);
        for node in nodes {
            builder.add_node(node)?;
        }
        builder.build()
    }

    /// Unit this graph belongs to.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Declared cross-unit input names.
    #[must_use]
    pub const fn inputs(&self) -> &BTreeSet<String> {
        &self.inputs
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter()
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).and_then(|&i| self.nodes.get(i))
    }

    /// Returns true if the graph has a node with this id.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Number of nodes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of nodes that directly depend on `id`, in insertion order.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.depends_on.iter().any(|d| d == id))
            .map(|n| n.id.as_str())
            .collect()
    }
}

impl DependencyGraph for ResourceGraph {
    fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    fn dependencies(&self, id: &str) -> Vec<&str> {
        self.get(id)
            .map(|n| n.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackplanError;
    use crate::graph::{AttributeValue, ResourceKind};

    fn node(id: &str) -> ResourceNode {
        ResourceNode::new(id, ResourceKind::Custom(String::from("test")))
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut builder = GraphBuilder::new("app");
        builder.add_node(node("net")).unwrap();
        let err = builder.add_node(node("net")).unwrap_err();

        assert!(matches!(
            err,
            StackplanError::Graph(GraphError::DuplicateId { ref id, .. }) if id == "net"
        ));
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_references_become_edges() {
        let graph = ResourceGraph::from_nodes(
            "app",
            [
                node("net"),
                node("storage").with_attribute("network", AttributeValue::reference("net", "id")),
                node("service")
                    .with_attribute("volume", AttributeValue::reference("storage", "id"))
                    .with_dependency("net"),
            ],
        )
        .unwrap();

        assert_eq!(graph.dependencies("storage"), vec!["net"]);
        // Explicit dependencies come first, then attribute references.
        assert_eq!(graph.dependencies("service"), vec!["net", "storage"]);
        assert_eq!(graph.dependents("net"), vec!["storage", "service"]);
        assert_eq!(graph.node_ids(), vec!["net", "storage", "service"]);
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let err = ResourceGraph::from_nodes(
            "app",
            [node("service").with_attribute("volume", AttributeValue::reference("storage", "id"))],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StackplanError::Graph(GraphError::UnresolvedReference { ref node, ref reference, .. })
                if node == "service" && reference == "storage.id"
        ));
    }

    #[test]
    fn test_unknown_explicit_dependency_rejected() {
        let err = ResourceGraph::from_nodes("app", [node("a").with_dependency("ghost")]).unwrap_err();
        assert!(matches!(err, StackplanError::Graph(GraphError::UnresolvedReference { .. })));
    }

    #[test]
    fn test_undeclared_input_rejected() {
        let mut builder = GraphBuilder::new("storage");
        builder
            .add_node(node("sg").with_attribute("network", AttributeValue::input("vpc_id")))
            .unwrap();
        assert!(builder.build().is_err());

        let mut builder = GraphBuilder::new("storage").with_inputs(["vpc_id"]);
        builder
            .add_node(node("sg").with_attribute("network", AttributeValue::input("vpc_id")))
            .unwrap();
        let graph = builder.build().unwrap();
        assert!(graph.inputs().contains("vpc_id"));
        assert!(graph.dependencies("sg").is_empty());
    }
}
