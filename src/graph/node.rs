//! Resource node and resource kind definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::value::AttributeValue;

/// Output map populated by a provider after a successful operation.
pub type Outputs = BTreeMap<String, Value>;

/// Declarative description of one desired cloud object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Identifier, unique within its deployment unit.
    pub id: String,
    /// Resource type tag.
    pub kind: ResourceKind,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Ids of nodes this node depends on, in first-mention order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Outputs, empty until the node has been provisioned.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: Outputs,
    /// Attributes that force replacement in addition to the kind's own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace_on: Vec<String>,
    /// What happens to the provider resource when the node is deleted.
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

/// What to do with the provider resource when its node is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    /// Delete the resource on the provider.
    #[default]
    Destroy,
    /// Keep the resource; only forget it in state.
    Retain,
}

/// Resource type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    /// Virtual network.
    Network,
    /// Subnet within a network.
    Subnet,
    /// Firewall rule set.
    SecurityGroup,
    /// Elastic shared file system.
    FileSystem,
    /// File system access point.
    AccessPoint,
    /// Container cluster.
    Cluster,
    /// Identity role.
    Role,
    /// Permission policy attached to a role.
    Policy,
    /// Container task definition.
    TaskDefinition,
    /// Load balancer.
    LoadBalancer,
    /// Load balancer target group.
    TargetGroup,
    /// Load balancer listener.
    Listener,
    /// Long-running container service.
    Service,
    /// Autoscaling target.
    ScalingTarget,
    /// Autoscaling policy.
    ScalingPolicy,
    /// Log group.
    LogGroup,
    /// Any kind the engine has no built-in knowledge of.
    Custom(String),
}

impl ResourceNode {
    /// Creates a node with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            outputs: Outputs::new(),
            replace_on: Vec::new(),
            removal_policy: RemovalPolicy::Destroy,
        }
    }

    /// Sets an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    /// Marks an extra attribute as forcing replacement.
    #[must_use]
    pub fn with_replace_on(mut self, attribute: impl Into<String>) -> Self {
        self.replace_on.push(attribute.into());
        self
    }

    /// Sets the removal policy.
    #[must_use]
    pub const fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }

    /// Returns true if a change to `attribute` requires replacing the resource.
    #[must_use]
    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.kind.immutable_attributes().iter().any(|a| *a == attribute)
            || self.replace_on.iter().any(|a| a == attribute)
    }

    /// Node ids referenced from attributes, in attribute order.
    #[must_use]
    pub fn referenced_nodes(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for value in self.attributes.values() {
            for r in value.references() {
                if !ids.contains(&r.node.as_str()) {
                    ids.push(&r.node);
                }
            }
        }
        ids
    }

    /// Names of attributes whose value references `node`.
    #[must_use]
    pub fn attributes_referencing(&self, node: &str) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(_, v)| v.mentions(node))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Returns true once the node has been provisioned.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        !self.outputs.is_empty()
    }
}

impl ResourceKind {
    /// Attributes that cannot change in place for this kind.
    #[must_use]
    pub fn immutable_attributes(&self) -> &'static [&'static str] {
        match self {
            Self::Network => &["cidr"],
            Self::Subnet => &["network", "cidr", "availability_zone"],
            Self::SecurityGroup => &["network", "description"],
            Self::FileSystem => &["performance_mode", "encrypted", "kms_key"],
            Self::AccessPoint => &["file_system", "path", "posix_user"],
            Self::Cluster | Self::LogGroup => &["name"],
            Self::Role => &["name", "assumed_by"],
            Self::TaskDefinition => &["family", "cpu", "memory", "containers", "volumes", "task_role"],
            Self::LoadBalancer => &["name", "scheme", "internet_facing"],
            Self::TargetGroup => &["name", "port", "protocol", "target_type", "network"],
            Self::Listener => &["load_balancer"],
            Self::Service => &["name", "cluster"],
            Self::ScalingTarget => &["resource", "dimension"],
            Self::ScalingPolicy => &["name", "target"],
            Self::Policy | Self::Custom(_) => &[],
        }
    }

    /// Canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "security-group",
            Self::FileSystem => "file-system",
            Self::AccessPoint => "access-point",
            Self::Cluster => "cluster",
            Self::Role => "role",
            Self::Policy => "policy",
            Self::TaskDefinition => "task-definition",
            Self::LoadBalancer => "load-balancer",
            Self::TargetGroup => "target-group",
            Self::Listener => "listener",
            Self::Service => "service",
            Self::ScalingTarget => "scaling-target",
            Self::ScalingPolicy => "scaling-policy",
            Self::LogGroup => "log-group",
            Self::Custom(name) => name,
        }
    }

    /// Returns true for kinds the engine knows about.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl FromStr for ResourceKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "network" => Self::Network,
            "subnet" => Self::Subnet,
            "security-group" => Self::SecurityGroup,
            "file-system" => Self::FileSystem,
            "access-point" => Self::AccessPoint,
            "cluster" => Self::Cluster,
            "role" => Self::Role,
            "policy" => Self::Policy,
            "task-definition" => Self::TaskDefinition,
            "load-balancer" => Self::LoadBalancer,
            "target-group" => Self::TargetGroup,
            "listener" => Self::Listener,
            "service" => Self::Service,
            "scaling-target" => Self::ScalingTarget,
            "scaling-policy" => Self::ScalingPolicy,
            "log-group" => Self::LogGroup,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl From<String> for ResourceKind {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<ResourceKind> for String {
    fn from(value: ResourceKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for RemovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destroy => f.write_str("destroy"),
            Self::Retain => f.write_str("retain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_known_and_custom() {
        assert_eq!("file-system".parse::<ResourceKind>().unwrap(), ResourceKind::FileSystem);
        let custom: ResourceKind = String::from("dns-record").into();
        assert_eq!(custom, ResourceKind::Custom(String::from("dns-record")));
        assert!(!custom.is_known());
        assert_eq!(custom.to_string(), "dns-record");
    }

    #[test]
    fn test_immutable_attributes() {
        let fs = ResourceNode::new("fs", ResourceKind::FileSystem);
        assert!(fs.is_immutable("performance_mode"));
        assert!(!fs.is_immutable("throughput_mode"));

        let custom = ResourceNode::new("x", ResourceKind::Custom(String::from("thing")))
            .with_replace_on("identity");
        assert!(custom.is_immutable("identity"));
    }

    #[test]
    fn test_referenced_nodes_deduplicated() {
        let node = ResourceNode::new("svc", ResourceKind::Service)
            .with_attribute("cluster", AttributeValue::reference("cluster", "arn"))
            .with_attribute("task", AttributeValue::reference("task", "arn"))
            .with_attribute("cluster_name", AttributeValue::reference("cluster", "name"));

        assert_eq!(node.referenced_nodes(), vec!["cluster", "task"]);
        assert_eq!(node.attributes_referencing("cluster"), vec!["cluster", "cluster_name"]);
        assert!(!node.is_provisioned());
    }
}
