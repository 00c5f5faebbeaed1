//! Resource graph module.
//!
//! This module holds the declarative model the engine plans over: resource
//! nodes with their attribute values, the per-unit dependency graph, and the
//! deployment units that group nodes and connect to each other.

mod builder;
mod node;
mod unit;
mod value;

pub use builder::{GraphBuilder, ResourceGraph};
pub use node::{Outputs, RemovalPolicy, ResourceKind, ResourceNode};
pub use unit::{DeploymentUnit, UnitGraph};
pub use value::{AttributeValue, OutputRef, ResolveScope, UnitOutputRef};

/// Anything the plan resolver can order.
///
/// Node ids are returned in insertion order and dependencies in declaration
/// order, which keeps resolution deterministic.
pub trait DependencyGraph {
    /// All node ids, in insertion order.
    fn node_ids(&self) -> Vec<&str>;

    /// Ids `id` depends on, in declaration order. Unknown ids have none.
    fn dependencies(&self, id: &str) -> Vec<&str>;
}
