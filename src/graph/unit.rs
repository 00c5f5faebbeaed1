//! Deployment units and the ordering between them.
//!
//! A unit is an independently planned and applied group of resource nodes.
//! Units consume each other's outputs through declared inputs, which gives
//! a second, coarser dependency graph over the units themselves.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::planner::PlanResolver;

use super::builder::ResourceGraph;
use super::value::{OutputRef, UnitOutputRef};
use super::DependencyGraph;

/// A named group of resource nodes planned and applied together.
#[derive(Debug, Clone)]
pub struct DeploymentUnit {
    /// Unit name, also the state namespace.
    pub name: String,
    /// The unit's resource graph.
    pub graph: ResourceGraph,
    /// Input name to the upstream output it reads.
    pub inputs: BTreeMap<String, UnitOutputRef>,
    /// Export name to the node output it publishes.
    pub exports: BTreeMap<String, OutputRef>,
}

/// Dependency graph over units, derived from their inputs.
#[derive(Debug)]
pub struct UnitGraph<'a> {
    units: Vec<&'a DeploymentUnit>,
}

impl DeploymentUnit {
    /// Creates a unit from an already built graph.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedReference` if an export names a node outside the graph.
    pub fn new(
        graph: ResourceGraph,
        inputs: BTreeMap<String, UnitOutputRef>,
        exports: BTreeMap<String, OutputRef>,
    ) -> Result<Self> {
        for (name, export) in &exports {
            if !graph.contains(&export.node) {
                return Err(GraphError::UnresolvedReference {
                    unit: graph.unit().to_string(),
                    node: format!("export:{name}"),
                    reference: export.to_string(),
                }
                .into());
            }
        }

        Ok(Self {
            name: graph.unit().to_string(),
            graph,
            inputs,
            exports,
        })
    }

    /// Names of the units this unit reads from, deduplicated, in input order.
    #[must_use]
    pub fn upstream_units(&self) -> Vec<&str> {
        let mut units: Vec<&str> = Vec::new();
        for input in self.inputs.values() {
            if !units.contains(&input.unit.as_str()) {
                units.push(&input.unit);
            }
        }
        units
    }

    /// Resolves every declared input to a concrete value.
    ///
    /// # Errors
    ///
    /// Returns `MissingUnitOutput` for the first input whose upstream output
    /// is not available yet.
    pub fn resolve_inputs(
        &self,
        lookup: impl Fn(&UnitOutputRef) -> Option<Value>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut values = BTreeMap::new();
        for (name, source) in &self.inputs {
            let value = lookup(source).ok_or_else(|| GraphError::MissingUnitOutput {
                unit: self.name.clone(),
                input: name.clone(),
                source_unit: source.unit.clone(),
                node: source.node.clone(),
                output: source.output.clone(),
            })?;
            values.insert(name.clone(), value);
        }
        Ok(values)
    }
}

impl<'a> UnitGraph<'a> {
    /// Builds the unit graph, checking that every input names a known unit.
    ///
    /// # Errors
    ///
    /// Returns `UnknownUnit` if an input points at a unit that is not declared.
    pub fn new(units: &'a [DeploymentUnit]) -> Result<Self> {
        for unit in units {
            for (input, source) in &unit.inputs {
                if !units.iter().any(|u| u.name == source.unit) {
                    return Err(GraphError::UnknownUnit {
                        unit: unit.name.clone(),
                        input: input.clone(),
                        target: source.unit.clone(),
                    }
                    .into());
                }
            }
        }

        Ok(Self {
            units: units.iter().collect(),
        })
    }

    /// Orders units so every producer precedes its consumers.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` naming the units if they depend on each
    /// other, directly or transitively.
    pub fn ordered(&self) -> Result<Vec<&'a DeploymentUnit>> {
        let plan = PlanResolver::new().resolve(self)?;
        debug!("Unit order: {}", plan.ids().join(" -> "));

        Ok(plan
            .iter()
            .filter_map(|name| self.units.iter().find(|u| u.name == name).copied())
            .collect())
    }
}

impl DependencyGraph for UnitGraph<'_> {
    fn node_ids(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name.as_str()).collect()
    }

    fn dependencies(&self, id: &str) -> Vec<&str> {
        self.units
            .iter()
            .find(|u| u.name == id)
            .map(|u| u.upstream_units())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackplanError;
    use crate::graph::{AttributeValue, GraphBuilder, ResourceKind, ResourceNode};
    use serde_json::json;

    fn unit(name: &str, inputs: &[(&str, &str)]) -> DeploymentUnit {
        let mut builder = GraphBuilder::new(name).with_inputs(inputs.iter().map(|(n, _)| *n));
        let mut node = ResourceNode::new("main", ResourceKind::Custom(String::from("test")));
        for (input, _) in inputs {
            node = node.with_attribute(*input, AttributeValue::input(*input));
        }
        builder.add_node(node).unwrap();

        let inputs = inputs
            .iter()
            .map(|(n, r)| ((*n).to_string(), r.parse().unwrap()))
            .collect();
        DeploymentUnit::new(builder.build().unwrap(), inputs, BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_units_ordered_by_inputs() {
        let units = vec![
            unit("compute", &[("fs", "storage.main.id"), ("vpc", "network.main.id")]),
            unit("storage", &[("vpc", "network.main.id")]),
            unit("network", &[]),
        ];

        let graph = UnitGraph::new(&units).unwrap();
        let names: Vec<&str> = graph.ordered().unwrap().iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["network", "storage", "compute"]);
    }

    #[test]
    fn test_unit_cycle_rejected() {
        let units = vec![
            unit("a", &[("x", "b.main.id")]),
            unit("b", &[("y", "a.main.id")]),
        ];

        let err = UnitGraph::new(&units).unwrap().ordered().unwrap_err();
        assert!(matches!(
            err,
            StackplanError::Graph(GraphError::CyclicDependency { ref cycle }) if cycle.contains(&String::from("a"))
        ));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let units = vec![unit("a", &[("x", "a.main.id")])];
        assert!(UnitGraph::new(&units).unwrap().ordered().is_err());
    }

    #[test]
    fn test_unknown_unit_rejected() {
        let units = vec![unit("a", &[("x", "ghost.main.id")])];
        assert!(matches!(
            UnitGraph::new(&units).unwrap_err(),
            StackplanError::Graph(GraphError::UnknownUnit { .. })
        ));
    }

    #[test]
    fn test_resolve_inputs() {
        let consumer = unit("storage", &[("vpc", "network.main.id")]);

        let values = consumer
            .resolve_inputs(|r| (r.unit == "network").then(|| json!("vpc-1")))
            .unwrap();
        assert_eq!(values["vpc"], json!("vpc-1"));

        let err = consumer.resolve_inputs(|_| None).unwrap_err();
        assert!(matches!(
            err,
            StackplanError::Graph(GraphError::MissingUnitOutput { ref input, .. }) if input == "vpc"
        ));
    }

    #[test]
    fn test_export_must_name_known_node() {
        let graph = GraphBuilder::new("x").build().unwrap();
        let exports = BTreeMap::from([(String::from("dns"), OutputRef::new("lb", "dns_name"))]);
        assert!(DeploymentUnit::new(graph, BTreeMap::new(), exports).is_err());
    }
}
