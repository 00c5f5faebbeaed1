//! State types for tracking applied resources.
//!
//! A snapshot records, per deployment unit, what was last applied for each
//! resource node: the declared attributes, their resolved values and the
//! provider outputs. It is the baseline the diff engine compares against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::graph::{
    AttributeValue, DependencyGraph, OutputRef, Outputs, RemovalPolicy, ResolveScope, ResourceKind,
};

/// Current version of the state format.
pub const STATE_FORMAT: &str = "1.0";

/// Maximum number of history entries kept in a snapshot.
const MAX_HISTORY: usize = 100;

/// Last-applied state of one deployment unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub format: String,
    /// Unit this snapshot belongs to.
    pub unit: String,
    /// Monotonic write version; 0 means never written.
    pub version: u64,
    /// Applied resources by node id.
    pub resources: BTreeMap<String, ResourceState>,
    /// Resolved unit exports.
    #[serde(default)]
    pub exports: BTreeMap<String, Value>,
    /// When the snapshot was last changed.
    pub last_updated: DateTime<Utc>,
    /// Recent operations (bounded).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Identifier of the last writer.
    #[serde(default)]
    pub writer: Option<String>,
}

/// Recorded state of one applied resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource kind at the time of apply.
    pub kind: ResourceKind,
    /// Declared attributes, references unresolved.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Attributes as sent to the provider.
    pub resolved: BTreeMap<String, Value>,
    /// Dependencies at the time of apply.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Provider outputs; always contains `id`.
    pub outputs: Outputs,
    /// Removal policy at the time of apply.
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
    /// Hash of the declared attributes.
    pub attribute_hash: String,
    /// When the resource was last created or updated.
    pub applied_at: DateTime<Utc>,
}

/// A single entry in the snapshot history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: Operation,
    /// Node the operation was for.
    pub node: String,
    /// Whether it succeeded.
    pub success: bool,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Provider operation kinds recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Resource created.
    Create,
    /// Resource updated in place.
    Update,
    /// Resource deleted.
    Delete,
    /// Resource dropped from state, provider resource kept.
    Forget,
}

/// Resolution scope over a snapshot's outputs and a set of input values.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotScope<'a> {
    snapshot: &'a StateSnapshot,
    inputs: &'a BTreeMap<String, Value>,
}

impl StateSnapshot {
    /// Creates an empty, never-written snapshot for `unit`.
    #[must_use]
    pub fn new(unit: &str) -> Self {
        Self {
            format: STATE_FORMAT.to_string(),
            unit: unit.to_string(),
            version: 0,
            resources: BTreeMap::new(),
            exports: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
            writer: None,
        }
    }

    /// Gets a resource by node id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    /// Returns true if a resource is recorded for `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    /// Records a resource after a successful create or update.
    pub fn record(&mut self, id: &str, resource: ResourceState) {
        self.resources.insert(id.to_string(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource after a successful delete.
    pub fn remove(&mut self, id: &str) -> Option<ResourceState> {
        let removed = self.resources.remove(id);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Looks up a recorded output value.
    #[must_use]
    pub fn output(&self, node: &str, output: &str) -> Option<&Value> {
        self.resources.get(node).and_then(|r| r.outputs.get(output))
    }

    /// Adds a history entry, dropping the oldest past the limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Resolution scope reading outputs from this snapshot.
    #[must_use]
    pub const fn scope<'a>(&'a self, inputs: &'a BTreeMap<String, Value>) -> SnapshotScope<'a> {
        SnapshotScope {
            snapshot: self,
            inputs,
        }
    }

    /// Recomputes exports from recorded outputs; missing outputs are skipped.
    pub fn refresh_exports(&mut self, exports: &BTreeMap<String, OutputRef>) {
        self.exports = exports
            .iter()
            .filter_map(|(name, r)| {
                self.output(&r.node, &r.output)
                    .map(|v| (name.clone(), v.clone()))
            })
            .collect();
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Recorded node ids, sorted.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

impl DependencyGraph for StateSnapshot {
    fn node_ids(&self) -> Vec<&str> {
        self.resource_ids()
    }

    fn dependencies(&self, id: &str) -> Vec<&str> {
        self.resources
            .get(id)
            .map(|r| r.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

impl ResolveScope for SnapshotScope<'_> {
    fn output(&self, reference: &OutputRef) -> Option<Value> {
        self.snapshot
            .output(&reference.node, &reference.output)
            .cloned()
    }

    fn input(&self, name: &str) -> Option<Value> {
        self.inputs.get(name).cloned()
    }
}

impl ResourceState {
    /// Physical id reported by the provider.
    #[must_use]
    pub fn physical_id(&self) -> Option<&str> {
        self.outputs.get("id").and_then(Value::as_str)
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: Operation, node: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            node: node.to_string(),
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: Operation, node: &str, error: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            node: node.to_string(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Forget => "forget",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(kind: ResourceKind, id: &str, deps: &[&str]) -> ResourceState {
        ResourceState {
            kind,
            attributes: BTreeMap::new(),
            resolved: BTreeMap::new(),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
            outputs: Outputs::from([(String::from("id"), json!(id))]),
            removal_policy: RemovalPolicy::Destroy,
            attribute_hash: String::new(),
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new("app");
        for i in 0..150 {
            snapshot.add_history(HistoryEntry::new(Operation::Create, &format!("n{i}")));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].node, "n50");
    }

    #[test]
    fn test_scope_reads_outputs_and_inputs() {
        let mut snapshot = StateSnapshot::new("app");
        snapshot.record("fs", resource(ResourceKind::FileSystem, "fs-1", &[]));
        let inputs = BTreeMap::from([(String::from("vpc"), json!("vpc-1"))]);

        let value = AttributeValue::List(vec![
            AttributeValue::reference("fs", "id"),
            AttributeValue::input("vpc"),
        ]);
        assert_eq!(value.resolve(&snapshot.scope(&inputs)).unwrap(), json!(["fs-1", "vpc-1"]));
        assert_eq!(snapshot.get("fs").and_then(ResourceState::physical_id), Some("fs-1"));
    }

    #[test]
    fn test_exports_refreshed_from_outputs() {
        let mut snapshot = StateSnapshot::new("compute");
        snapshot.record("lb", resource(ResourceKind::LoadBalancer, "lb-1", &[]));
        let exports = BTreeMap::from([
            (String::from("lb_id"), OutputRef::new("lb", "id")),
            (String::from("missing"), OutputRef::new("svc", "id")),
        ]);

        snapshot.refresh_exports(&exports);
        assert_eq!(snapshot.exports.len(), 1);
        assert_eq!(snapshot.exports["lb_id"], json!("lb-1"));
    }

    #[test]
    fn test_recorded_dependencies_form_graph() {
        let mut snapshot = StateSnapshot::new("app");
        snapshot.record("svc", resource(ResourceKind::Service, "s", &["ap"]));
        snapshot.record("ap", resource(ResourceKind::AccessPoint, "a", &["fs"]));
        snapshot.record("fs", resource(ResourceKind::FileSystem, "f", &[]));

        assert_eq!(snapshot.node_ids(), vec!["ap", "fs", "svc"]);
        assert_eq!(snapshot.dependencies("svc"), vec!["ap"]);
        assert!(snapshot.remove("svc").is_some());
        assert!(!snapshot.contains("svc"));
    }
}
