//! Diff engine for comparing a desired graph against last-applied state.
//!
//! Every node id present on either side gets exactly one classification.
//! Forced replacements are then propagated along dependency edges, since a
//! replaced node comes back with new outputs its dependents consume.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::graph::{ResourceGraph, ResourceNode};
use crate::state::{ResourceState, StateSnapshot};

/// Engine for computing diffs between desired and recorded states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Attribute hasher.
    hasher: ConfigHasher,
    /// Current cross-unit input values, if known.
    inputs: Option<BTreeMap<String, Value>>,
}

/// Difference for a single node.
#[derive(Debug, Clone)]
pub struct NodeDiff {
    /// Node id.
    pub id: String,
    /// Classification.
    pub change: ChangeKind,
    /// Why the node got this classification.
    pub reason: ChangeReason,
    /// Changed fields, empty for creates, deletes and propagated changes.
    pub fields: Vec<FieldChange>,
    /// Recorded attribute hash (if any).
    pub old_hash: Option<String>,
    /// Desired attribute hash (if any).
    pub new_hash: Option<String>,
}

/// Node classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Desired, not recorded.
    Create,
    /// Recorded, attributes differ, updatable in place.
    Update,
    /// Recorded, must be deleted and recreated.
    Replace,
    /// Recorded, no longer desired.
    Delete,
    /// Recorded and equal.
    Unchanged,
}

/// Origin of a classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeReason {
    /// The node's own declaration changed.
    Declared,
    /// A node it depends on is being replaced.
    Propagated {
        /// The node whose replacement triggered this change.
        from: String,
    },
    /// A cross-unit input it reads resolved to a new value.
    InputChanged,
}

/// Detail about one changed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    /// Attribute name (or `kind`).
    pub field: String,
    /// Recorded value.
    pub old_value: Option<Value>,
    /// Desired value.
    pub new_value: Option<Value>,
    /// Whether this field alone forces a replacement.
    pub forces_replacement: bool,
}

/// Complete diff of one unit.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Desired nodes in graph order, then recorded-only nodes.
    pub diffs: Vec<NodeDiff>,
    /// Number of nodes to create.
    pub creates: usize,
    /// Number of nodes to update.
    pub updates: usize,
    /// Number of nodes to replace.
    pub replaces: usize,
    /// Number of nodes to delete.
    pub deletes: usize,
    /// Number of unchanged nodes.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
            inputs: None,
        }
    }

    /// Also detects nodes whose input-bearing attributes resolve differently
    /// under these input values.
    #[must_use]
    pub fn with_inputs(mut self, inputs: BTreeMap<String, Value>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Computes the diff between the desired graph and the snapshot.
    #[must_use]
    pub fn diff(&self, desired: &ResourceGraph, snapshot: &StateSnapshot) -> DiffResult {
        let mut diffs: Vec<NodeDiff> = desired
            .nodes()
            .map(|node| self.diff_node(node, snapshot))
            .collect();

        if let Some(inputs) = &self.inputs {
            for (node, diff) in desired.nodes().zip(diffs.iter_mut()) {
                if let Some(recorded) = snapshot.get(&node.id) {
                    Self::detect_input_changes(node, recorded, snapshot, inputs, diff);
                }
            }
        }

        Self::propagate(desired, &mut diffs);

        for id in snapshot.resource_ids() {
            if !desired.contains(id) {
                debug!("Resource {id} is no longer declared");
                diffs.push(NodeDiff {
                    id: id.to_string(),
                    change: ChangeKind::Delete,
                    reason: ChangeReason::Declared,
                    fields: Vec::new(),
                    old_hash: snapshot.get(id).map(|r| r.attribute_hash.clone()),
                    new_hash: None,
                });
            }
        }

        DiffResult::from_diffs(diffs)
    }

    /// Classifies one desired node on its own declaration.
    fn diff_node(&self, node: &ResourceNode, snapshot: &StateSnapshot) -> NodeDiff {
        let new_hash = self.hasher.hash_attributes(&node.attributes);

        let Some(recorded) = snapshot.get(&node.id) else {
            debug!("Resource {} needs to be created", node.id);
            return NodeDiff {
                id: node.id.clone(),
                change: ChangeKind::Create,
                reason: ChangeReason::Declared,
                fields: Vec::new(),
                old_hash: None,
                new_hash: Some(new_hash),
            };
        };

        let mut fields = Vec::new();
        if recorded.kind != node.kind {
            fields.push(FieldChange {
                field: String::from("kind"),
                old_value: Some(Value::String(recorded.kind.to_string())),
                new_value: Some(Value::String(node.kind.to_string())),
                forces_replacement: true,
            });
        } else if recorded.attribute_hash != new_hash {
            fields = Self::compare_attributes(node, recorded);
        }

        let change = if fields.iter().any(|f| f.forces_replacement) {
            ChangeKind::Replace
        } else if fields.is_empty() {
            ChangeKind::Unchanged
        } else {
            ChangeKind::Update
        };
        debug!("Resource {} classified as {change}", node.id);

        NodeDiff {
            id: node.id.clone(),
            change,
            reason: ChangeReason::Declared,
            fields,
            old_hash: Some(recorded.attribute_hash.clone()),
            new_hash: Some(new_hash),
        }
    }

    /// Field-by-field comparison of declared attributes.
    fn compare_attributes(node: &ResourceNode, recorded: &ResourceState) -> Vec<FieldChange> {
        let names: BTreeSet<&String> = node
            .attributes
            .keys()
            .chain(recorded.attributes.keys())
            .collect();

        names
            .into_iter()
            .filter_map(|name| {
                let old = recorded.attributes.get(name);
                let new = node.attributes.get(name);
                (old != new).then(|| FieldChange {
                    field: name.clone(),
                    old_value: old.cloned().map(Value::from),
                    new_value: new.cloned().map(Value::from),
                    forces_replacement: node.is_immutable(name),
                })
            })
            .collect()
    }

    /// Compares input-bearing attributes against their recorded resolution.
    fn detect_input_changes(
        node: &ResourceNode,
        recorded: &ResourceState,
        snapshot: &StateSnapshot,
        inputs: &BTreeMap<String, Value>,
        diff: &mut NodeDiff,
    ) {
        let scope = snapshot.scope(inputs);

        for (name, value) in node.attributes.iter().filter(|(_, v)| v.has_inputs()) {
            let Ok(resolved) = value.resolve(&scope) else {
                continue;
            };
            let old = recorded.resolved.get(name);
            if old == Some(&resolved) || diff.fields.iter().any(|f| f.field == *name) {
                continue;
            }

            let forces = node.is_immutable(name);
            diff.fields.push(FieldChange {
                field: name.clone(),
                old_value: old.cloned(),
                new_value: Some(resolved),
                forces_replacement: forces,
            });

            let target = if forces { ChangeKind::Replace } else { ChangeKind::Update };
            if target.rank() > diff.change.rank() {
                if diff.change == ChangeKind::Unchanged {
                    diff.reason = ChangeReason::InputChanged;
                }
                diff.change = target;
                debug!("Resource {} reads changed input via '{name}'", node.id);
            }
        }
    }

    /// Upgrades transitive dependents of replaced nodes.
    fn propagate(desired: &ResourceGraph, diffs: &mut [NodeDiff]) {
        let index: BTreeMap<String, usize> = diffs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();

        let mut queue: VecDeque<usize> = diffs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.change == ChangeKind::Replace)
            .map(|(i, _)| i)
            .collect();
        let mut visited: HashSet<usize> = queue.iter().copied().collect();

        while let Some(source) = queue.pop_front() {
            let source_id = diffs[source].id.clone();
            let source_replaced = diffs[source].change == ChangeKind::Replace;

            for dependent in desired.dependents(&source_id) {
                let (Some(&i), Some(node)) = (index.get(dependent), desired.get(dependent)) else {
                    continue;
                };
                if diffs[i].change == ChangeKind::Create {
                    continue;
                }

                let forces = source_replaced
                    && node
                        .attributes_referencing(&source_id)
                        .iter()
                        .any(|attr| node.is_immutable(attr));
                let target = if forces { ChangeKind::Replace } else { ChangeKind::Update };

                let diff = &mut diffs[i];
                let upgraded = target.rank() > diff.change.rank();
                if upgraded {
                    debug!("Resource {} upgraded to {target} by {source_id}", diff.id);
                    diff.change = target;
                    diff.reason = ChangeReason::Propagated {
                        from: source_id.clone(),
                    };
                }

                if visited.insert(i) || upgraded {
                    queue.push_back(i);
                }
            }
        }
    }
}

impl ChangeKind {
    /// Severity used when upgrading a classification.
    const fn rank(self) -> u8 {
        match self {
            Self::Unchanged => 0,
            Self::Update => 1,
            Self::Replace => 2,
            Self::Create | Self::Delete => 3,
        }
    }
}

impl DiffResult {
    fn from_diffs(diffs: Vec<NodeDiff>) -> Self {
        let count = |kind: ChangeKind| diffs.iter().filter(|d| d.change == kind).count();
        Self {
            creates: count(ChangeKind::Create),
            updates: count(ChangeKind::Update),
            replaces: count(ChangeKind::Replace),
            deletes: count(ChangeKind::Delete),
            unchanged: count(ChangeKind::Unchanged),
            diffs,
        }
    }

    /// Looks up the diff of a node.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&NodeDiff> {
        self.diffs.iter().find(|d| d.id == id)
    }

    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&NodeDiff> {
        self.diffs
            .iter()
            .filter(|d| d.change != ChangeKind::Unchanged)
            .collect()
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Unchanged => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Declared => write!(f, "declared"),
            Self::Propagated { from } => write!(f, "replacement of '{from}'"),
            Self::InputChanged => write!(f, "input changed"),
        }
    }
}

impl std::fmt::Display for NodeDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.change)?;
        if !self.fields.is_empty() {
            let fields: Vec<&str> = self.fields.iter().map(|d| d.field.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        if self.reason != ChangeReason::Declared {
            write!(f, " [{}]", self.reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttributeValue, ResourceKind};
    use chrono::Utc;
    use serde_json::json;

    fn storage_graph(performance_mode: &str, throughput: &str) -> ResourceGraph {
        ResourceGraph::from_nodes(
            "storage",
            [
                ResourceNode::new("vpc", ResourceKind::Network).with_attribute("cidr", "10.0.0.0/16"),
                ResourceNode::new("fs", ResourceKind::FileSystem)
                    .with_attribute("performance_mode", performance_mode)
                    .with_attribute("throughput_mode", throughput)
                    .with_attribute("network", AttributeValue::reference("vpc", "id")),
                ResourceNode::new("ap", ResourceKind::AccessPoint)
                    .with_attribute("file_system", AttributeValue::reference("fs", "id"))
                    .with_attribute("path", "/n8n"),
                ResourceNode::new("svc", ResourceKind::Service)
                    .with_attribute("name", "n8n")
                    .with_attribute("access_point", AttributeValue::reference("ap", "arn")),
            ],
        )
        .unwrap()
    }

    /// Snapshot as if `graph` had been applied.
    fn applied(graph: &ResourceGraph) -> StateSnapshot {
        let hasher = ConfigHasher::new();
        let mut snapshot = StateSnapshot::new(graph.unit());
        for node in graph.nodes() {
            snapshot.record(
                &node.id,
                ResourceState {
                    kind: node.kind.clone(),
                    attributes: node.attributes.clone(),
                    resolved: BTreeMap::new(),
                    depends_on: node.depends_on.clone(),
                    outputs: BTreeMap::from([(String::from("id"), json!(format!("{}-1", node.id)))]),
                    removal_policy: node.removal_policy,
                    attribute_hash: hasher.hash_attributes(&node.attributes),
                    applied_at: Utc::now(),
                },
            );
        }
        snapshot
    }

    fn change(result: &DiffResult, id: &str) -> ChangeKind {
        result.get(id).map(|d| d.change).unwrap()
    }

    #[test]
    fn test_diff_against_itself_is_unchanged() {
        let graph = storage_graph("generalPurpose", "bursting");
        let result = DiffEngine::new().diff(&graph, &applied(&graph));

        assert!(!result.has_changes());
        assert_eq!(result.unchanged, 4);
    }

    #[test]
    fn test_create_and_delete() {
        let graph = storage_graph("generalPurpose", "bursting");
        let mut snapshot = applied(&graph);
        snapshot.remove("svc");
        let mut orphan = snapshot.get("vpc").cloned().unwrap();
        orphan.depends_on.clear();
        snapshot.record("old-queue", orphan);

        let result = DiffEngine::new().diff(&graph, &snapshot);
        assert_eq!(change(&result, "svc"), ChangeKind::Create);
        assert_eq!(change(&result, "old-queue"), ChangeKind::Delete);
        assert_eq!(result.diffs.last().map(|d| d.id.as_str()), Some("old-queue"));
        assert_eq!(result.total_changes(), 2);
    }

    #[test]
    fn test_mutable_change_is_update() {
        let before = storage_graph("generalPurpose", "bursting");
        let after = storage_graph("generalPurpose", "elastic");
        let result = DiffEngine::new().diff(&after, &applied(&before));

        let fs = result.get("fs").unwrap();
        assert_eq!(fs.change, ChangeKind::Update);
        assert_eq!(fs.fields.len(), 1);
        assert_eq!(fs.fields[0].new_value, Some(json!("elastic")));
        // Update keeps outputs, nothing propagates.
        assert_eq!(change(&result, "ap"), ChangeKind::Unchanged);
    }

    #[test]
    fn test_replacement_propagates_transitively() {
        let before = storage_graph("generalPurpose", "bursting");
        let after = storage_graph("maxIO", "bursting");
        let result = DiffEngine::new().diff(&after, &applied(&before));

        assert_eq!(change(&result, "fs"), ChangeKind::Replace);
        // `file_system` is immutable on an access point.
        assert_eq!(change(&result, "ap"), ChangeKind::Replace);
        // `access_point` is mutable on a service.
        let svc = result.get("svc").unwrap();
        assert_eq!(svc.change, ChangeKind::Update);
        assert_eq!(svc.reason, ChangeReason::Propagated { from: String::from("ap") });
        assert_eq!(change(&result, "vpc"), ChangeKind::Unchanged);
    }

    #[test]
    fn test_kind_change_forces_replace() {
        let before = storage_graph("generalPurpose", "bursting");
        let mut snapshot = applied(&before);
        if let Some(vpc) = snapshot.resources.get_mut("vpc") {
            vpc.kind = ResourceKind::Custom(String::from("legacy-network"));
        }

        let result = DiffEngine::new().diff(&before, &snapshot);
        assert_eq!(change(&result, "vpc"), ChangeKind::Replace);
        // Every node transitively depends on the network.
        assert!(result.diffs.iter().all(|d| d.change != ChangeKind::Unchanged));
    }

    #[test]
    fn test_input_change_marks_update() {
        let mut builder = crate::graph::GraphBuilder::new("storage").with_inputs(["vpc_id"]);
        builder
            .add_node(
                ResourceNode::new("sg", ResourceKind::SecurityGroup)
                    .with_attribute("ingress", AttributeValue::input("vpc_id")),
            )
            .unwrap();
        let graph = builder.build().unwrap();

        let mut snapshot = applied(&graph);
        if let Some(sg) = snapshot.resources.get_mut("sg") {
            sg.resolved.insert(String::from("ingress"), json!("vpc-old"));
        }

        let same = DiffEngine::new()
            .with_inputs(BTreeMap::from([(String::from("vpc_id"), json!("vpc-old"))]))
            .diff(&graph, &snapshot);
        assert_eq!(change(&same, "sg"), ChangeKind::Unchanged);

        let moved = DiffEngine::new()
            .with_inputs(BTreeMap::from([(String::from("vpc_id"), json!("vpc-new"))]))
            .diff(&graph, &snapshot);
        let sg = moved.get("sg").unwrap();
        assert_eq!(sg.change, ChangeKind::Update);
        assert_eq!(sg.reason, ChangeReason::InputChanged);
    }

    #[test]
    fn test_display() {
        let diff = NodeDiff {
            id: String::from("svc"),
            change: ChangeKind::Update,
            reason: ChangeReason::Propagated { from: String::from("ap") },
            fields: Vec::new(),
            old_hash: None,
            new_hash: None,
        };
        assert_eq!(diff.to_string(), "svc: update [replacement of 'ap']");
    }
}
