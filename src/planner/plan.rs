//! Deployment plan types and construction.
//!
//! A plan turns a diff into executable steps: desired nodes in provisioning
//! order, then deletions of nodes that are no longer declared in teardown
//! order. Each step lists the steps that must complete before it may start.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::GuardrailsConfig;
use crate::error::Result;
use crate::graph::{RemovalPolicy, ResourceGraph, ResourceNode};
use crate::state::{ResourceState, StateSnapshot};

use super::diff::{ChangeKind, ChangeReason, DiffResult, NodeDiff};
use super::resolver::{PlanResolver, ProvisioningPlan};

/// A complete deployment plan for one unit.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    /// Unit the plan applies to.
    pub unit: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Snapshot version the plan was computed against.
    pub base_version: u64,
    /// Steps in execution order.
    pub steps: Vec<PlannedStep>,
    /// Whether the plan passes guardrails.
    pub passes_guardrails: bool,
    /// Guardrail violations (if any).
    pub guardrail_violations: Vec<String>,
}

/// A single planned step.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// Node the step operates on.
    pub node_id: String,
    /// What to do.
    pub action: ActionType,
    /// Why the step is needed.
    pub reason: String,
    /// Desired node, absent for deletions.
    pub node: Option<ResourceNode>,
    /// Recorded state, absent for creations.
    pub prior: Option<ResourceState>,
    /// Desired attribute hash, absent for deletions.
    pub new_hash: Option<String>,
    /// Indices of steps that must complete first.
    pub dependencies: Vec<usize>,
}

/// Types of steps in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete and recreate a resource.
    Replace,
    /// Delete a resource.
    Delete,
}

impl DeploymentPlan {
    /// Creates a plan from a diff of `graph` against `snapshot`.
    ///
    /// `order` must be the provisioning plan resolved for `graph`.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the recorded dependencies of the nodes
    /// to delete form a cycle.
    pub fn from_diff(
        graph: &ResourceGraph,
        order: &ProvisioningPlan,
        diff: &DiffResult,
        snapshot: &StateSnapshot,
        guardrails: Option<&GuardrailsConfig>,
    ) -> Result<Self> {
        let mut steps = Vec::new();
        let mut index: BTreeMap<&str, usize> = BTreeMap::new();

        for id in order.iter() {
            let Some(node_diff) = diff.get(id) else {
                continue;
            };
            let Some(action) = ActionType::from_change(node_diff.change) else {
                continue;
            };

            let node = graph.get(id);
            let dependencies = Self::nearest_steps(id, &index, |current| {
                graph
                    .get(current)
                    .map(|n| n.depends_on.iter().map(String::as_str).collect())
                    .unwrap_or_default()
            });

            index.insert(id, steps.len());
            steps.push(PlannedStep {
                node_id: id.to_string(),
                action,
                reason: Self::describe_reason(node_diff),
                node: node.cloned(),
                prior: snapshot.get(id).cloned(),
                new_hash: node_diff.new_hash.clone(),
                dependencies,
            });
        }

        let resolver = PlanResolver::new();
        let teardown = resolver.reverse(&resolver.resolve(snapshot)?);

        for id in teardown.iter() {
            if diff.get(id).map(|d| d.change) != Some(ChangeKind::Delete) {
                continue;
            }

            let dependencies = Self::recorded_dependents(snapshot, id, &index);
            index.insert(id, steps.len());
            steps.push(PlannedStep {
                node_id: id.to_string(),
                action: ActionType::Delete,
                reason: String::from("removed from configuration"),
                node: None,
                prior: snapshot.get(id).cloned(),
                new_hash: None,
                dependencies,
            });
        }

        let guardrail_violations = guardrails
            .map(|g| Self::check_guardrails(g, &steps))
            .unwrap_or_default();

        Ok(Self {
            unit: graph.unit().to_string(),
            created_at: Utc::now(),
            base_version: snapshot.version,
            steps,
            passes_guardrails: guardrail_violations.is_empty(),
            guardrail_violations,
        })
    }

    /// Creates a plan deleting every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the recorded dependencies form a cycle.
    pub fn teardown(snapshot: &StateSnapshot) -> Result<Self> {
        let resolver = PlanResolver::new();
        let order = resolver.reverse(&resolver.resolve(snapshot)?);

        let mut steps = Vec::with_capacity(order.len());
        let mut index: BTreeMap<&str, usize> = BTreeMap::new();

        for id in order.iter() {
            let dependencies = Self::recorded_dependents(snapshot, id, &index);
            index.insert(id, steps.len());
            steps.push(PlannedStep {
                node_id: id.to_string(),
                action: ActionType::Delete,
                reason: String::from("unit destroyed"),
                node: None,
                prior: snapshot.get(id).cloned(),
                new_hash: None,
                dependencies,
            });
        }

        Ok(Self {
            unit: snapshot.unit.clone(),
            created_at: Utc::now(),
            base_version: snapshot.version,
            steps,
            passes_guardrails: true,
            guardrail_violations: Vec::new(),
        })
    }

    /// Steps of already planned nodes that recorded a dependency on `id`,
    /// directly or through nodes without a step.
    fn recorded_dependents(
        snapshot: &StateSnapshot,
        id: &str,
        index: &BTreeMap<&str, usize>,
    ) -> Vec<usize> {
        Self::nearest_steps(id, index, |current| {
            snapshot
                .resources
                .iter()
                .filter(|(_, r)| r.depends_on.iter().any(|d| d == current))
                .map(|(other, _)| other.as_str())
                .collect()
        })
    }

    /// Walks `next` from `start` and returns the indices of the first planned
    /// steps met on every path. Nodes without a step are passed through, so
    /// an unchanged node in the middle of a chain still orders its ends.
    fn nearest_steps<'a>(
        start: &str,
        index: &BTreeMap<&str, usize>,
        next: impl Fn(&str) -> Vec<&'a str>,
    ) -> Vec<usize> {
        let mut found = BTreeSet::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut pending = next(start);

        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            match index.get(id) {
                Some(&step) => {
                    found.insert(step);
                }
                None => pending.extend(next(id)),
            }
        }

        found.into_iter().collect()
    }

    fn describe_reason(diff: &NodeDiff) -> String {
        match (&diff.reason, diff.change) {
            (ChangeReason::Declared, ChangeKind::Create) => String::from("declared in configuration"),
            (ChangeReason::Declared, _) if !diff.fields.is_empty() => {
                let fields: Vec<&str> = diff.fields.iter().map(|f| f.field.as_str()).collect();
                format!("changed {}", fields.join(", "))
            }
            (reason, _) => reason.to_string(),
        }
    }

    fn check_guardrails(guardrails: &GuardrailsConfig, steps: &[PlannedStep]) -> Vec<String> {
        let mut violations = Vec::new();

        if let Some(max_deletes) = guardrails.max_deletes {
            let deletes = steps.iter().filter(|s| s.destroys()).count();
            if deletes > max_deletes {
                violations.push(format!(
                    "Plan deletes {deletes} resources but max_deletes is {max_deletes}"
                ));
            }
        }

        if !guardrails.allow_replace {
            let replaced: Vec<&str> = steps
                .iter()
                .filter(|s| s.action == ActionType::Replace)
                .map(|s| s.node_id.as_str())
                .collect();
            if !replaced.is_empty() {
                violations.push(format!(
                    "Plan replaces {} but replacements are not allowed",
                    replaced.join(", ")
                ));
            }
        }

        violations
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns the number of steps with the given action.
    #[must_use]
    pub fn count(&self, action: ActionType) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    /// Gets the step for a node.
    #[must_use]
    pub fn step(&self, node_id: &str) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }
}

impl ActionType {
    /// Maps a diff classification to an action, `None` for unchanged nodes.
    #[must_use]
    pub const fn from_change(change: ChangeKind) -> Option<Self> {
        match change {
            ChangeKind::Create => Some(Self::Create),
            ChangeKind::Update => Some(Self::Update),
            ChangeKind::Replace => Some(Self::Replace),
            ChangeKind::Delete => Some(Self::Delete),
            ChangeKind::Unchanged => None,
        }
    }
}

impl PlannedStep {
    /// Returns true if the step removes a provider resource.
    #[must_use]
    pub fn destroys(&self) -> bool {
        self.action == ActionType::Delete
            && self
                .prior
                .as_ref()
                .is_some_and(|p| p.removal_policy == RemovalPolicy::Destroy)
    }

    /// Returns a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        let kind = self
            .node
            .as_ref()
            .map(|n| n.kind.to_string())
            .or_else(|| self.prior.as_ref().map(|p| p.kind.to_string()))
            .unwrap_or_default();

        match self.action {
            ActionType::Create => format!("Create {kind} '{}'", self.node_id),
            ActionType::Update => format!("Update {kind} '{}'", self.node_id),
            ActionType::Replace => format!("Replace {kind} '{}'", self.node_id),
            ActionType::Delete if self.destroys() => format!("Delete {kind} '{}'", self.node_id),
            ActionType::Delete => format!("Forget {kind} '{}' (retained)", self.node_id),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.node_id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "{}: no changes required", self.unit);
        }

        writeln!(f, "Plan for {} ({} steps):", self.unit, self.steps.len())?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {i}. {step}")?;
        }

        if !self.guardrail_violations.is_empty() {
            writeln!(f, "\nGuardrail violations:")?;
            for violation in &self.guardrail_violations {
                writeln!(f, "  - {violation}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigHasher;
    use crate::graph::{AttributeValue, ResourceKind};
    use crate::planner::DiffEngine;
    use serde_json::json;

    fn graph(nodes: Vec<ResourceNode>) -> ResourceGraph {
        ResourceGraph::from_nodes("compute", nodes).unwrap()
    }

    fn applied(graph: &ResourceGraph) -> StateSnapshot {
        let hasher = ConfigHasher::new();
        let mut snapshot = StateSnapshot::new(graph.unit());
        snapshot.version = 3;
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

    fn plan(
        desired: &ResourceGraph,
        snapshot: &StateSnapshot,
        guardrails: Option<&GuardrailsConfig>,
    ) -> DeploymentPlan {
        let order = PlanResolver::new().resolve(desired).unwrap();
        let diff = DiffEngine::new().diff(desired, snapshot);
        DeploymentPlan::from_diff(desired, &order, &diff, snapshot, guardrails).unwrap()
    }

    fn three_tier() -> Vec<ResourceNode> {
        vec![
            ResourceNode::new("net", ResourceKind::Network).with_attribute("cidr", "10.0.0.0/16"),
            ResourceNode::new("storage", ResourceKind::FileSystem)
                .with_attribute("encrypted", true)
                .with_attribute("network", AttributeValue::reference("net", "id")),
            ResourceNode::new("service", ResourceKind::Service)
                .with_attribute("name", "n8n")
                .with_attribute("file_system", AttributeValue::reference("storage", "id")),
        ]
    }

    #[test]
    fn test_fresh_plan_creates_in_order() {
        let desired = graph(three_tier());
        let plan = plan(&desired, &StateSnapshot::new("compute"), None);

        let ids: Vec<&str> = plan.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, ["net", "storage", "service"]);
        assert_eq!(plan.count(ActionType::Create), 3);
        assert_eq!(plan.steps[1].dependencies, vec![0]);
        assert_eq!(plan.steps[2].dependencies, vec![1]);
        assert_eq!(plan.base_version, 0);
    }

    #[test]
    fn test_unchanged_plan_is_empty() {
        let desired = graph(three_tier());
        let plan = plan(&desired, &applied(&desired), None);
        assert!(plan.is_empty());
        assert!(plan.to_string().contains("no changes"));
    }

    #[test]
    fn test_replace_includes_propagated_update() {
        let before = graph(three_tier());
        let snapshot = applied(&before);

        let mut nodes = three_tier();
        nodes[1] = nodes[1].clone().with_attribute("encrypted", false);
        let plan = plan(&graph(nodes), &snapshot, None);

        assert_eq!(plan.step_count(), 2);
        assert_eq!(plan.steps[0].action, ActionType::Replace);
        assert_eq!(plan.steps[1].action, ActionType::Update);
        assert_eq!(plan.steps[1].reason, "replacement of 'storage'");
        assert_eq!(plan.steps[1].dependencies, vec![0]);
        assert_eq!(plan.base_version, 3);
    }

    #[test]
    fn test_dependencies_pass_through_unchanged_nodes() {
        let snapshot = applied(&graph(three_tier()));

        let mut nodes = three_tier();
        nodes[0] = nodes[0].clone().with_attribute("tag", "blue");
        nodes[2] = nodes[2].clone().with_attribute("desired_count", 2_i64);
        let plan = plan(&graph(nodes), &snapshot, None);

        let ids: Vec<&str> = plan.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, ["net", "service"]);
        assert_eq!(plan.count(ActionType::Update), 2);
        assert_eq!(plan.steps[1].dependencies, vec![0]);
    }

    #[test]
    fn test_orphans_deleted_dependents_first() {
        let before = graph(vec![
            ResourceNode::new("net", ResourceKind::Network),
            ResourceNode::new("lb", ResourceKind::LoadBalancer)
                .with_attribute("network", AttributeValue::reference("net", "id")),
            ResourceNode::new("listener", ResourceKind::Listener)
                .with_attribute("load_balancer", AttributeValue::reference("lb", "arn")),
        ]);
        let snapshot = applied(&before);
        let desired = graph(vec![ResourceNode::new("net", ResourceKind::Network)]);

        let plan = plan(&desired, &snapshot, None);
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, ["listener", "lb"]);
        assert_eq!(plan.steps[1].dependencies, vec![0]);
        assert!(plan.steps.iter().all(PlannedStep::destroys));
    }

    #[test]
    fn test_guardrails() {
        let before = graph(three_tier());
        let snapshot = applied(&before);

        let mut nodes = three_tier();
        nodes[1] = nodes[1].clone().with_attribute("encrypted", false);
        nodes.pop();
        let guardrails = GuardrailsConfig {
            max_deletes: Some(0),
            allow_replace: false,
        };
        let plan = plan(&graph(nodes), &snapshot, Some(&guardrails));

        assert!(!plan.passes_guardrails);
        assert_eq!(plan.guardrail_violations.len(), 2);
        assert!(plan.to_string().contains("Guardrail violations"));
    }

    #[test]
    fn test_retained_delete_does_not_count_as_destroy() {
        let before = graph(vec![
            ResourceNode::new("fs", ResourceKind::FileSystem)
                .with_removal_policy(RemovalPolicy::Retain),
        ]);
        let snapshot = applied(&before);
        let guardrails = GuardrailsConfig {
            max_deletes: Some(0),
            allow_replace: true,
        };
        let plan = plan(&graph(Vec::new()), &snapshot, Some(&guardrails));

        assert_eq!(plan.count(ActionType::Delete), 1);
        assert!(plan.passes_guardrails);
        assert!(plan.steps[0].description().starts_with("Forget"));
    }

    #[test]
    fn test_teardown_is_reverse_order() {
        let snapshot = applied(&graph(three_tier()));
        let plan = DeploymentPlan::teardown(&snapshot).unwrap();

        let ids: Vec<&str> = plan.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, ["service", "storage", "net"]);
        assert_eq!(plan.steps[1].dependencies, vec![0]);
        assert_eq!(plan.steps[2].dependencies, vec![1]);
    }
}
