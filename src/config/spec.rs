//! Configuration specification types for stackplan.
//!
//! This module defines all the structs that map to the `stackplan.yaml` file.
//! These types are declarative and fully describe the desired state of every
//! deployment unit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::graph::{
    AttributeValue, DeploymentUnit, GraphBuilder, OutputRef, RemovalPolicy, ResourceKind,
    ResourceNode, UnitOutputRef,
};
use crate::planner::ReplaceStrategy;
use crate::provider::RetryPolicy;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Execution tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Optional guardrails configuration.
    #[serde(default)]
    pub guardrails: Option<GuardrailsConfig>,
    /// Deployment units.
    pub units: Vec<UnitConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider implementation.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the HTTP provider.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// File the local provider persists its resources to.
    #[serde(default)]
    pub path: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process simulated provider.
    #[default]
    Local,
    /// Remote provider over HTTP.
    Http,
}

/// Execution tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of independent node operations in flight.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Order of the two halves of a replacement.
    #[serde(default)]
    pub replace_strategy: ReplaceStrategy,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Guardrails configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardrailsConfig {
    /// Maximum number of deletions a single plan may contain.
    #[serde(default)]
    pub max_deletes: Option<usize>,
    /// Whether plans may replace resources.
    #[serde(default = "default_allow_replace")]
    pub allow_replace: bool,
}

/// Configuration for a single deployment unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitConfig {
    /// Unique unit name.
    pub name: String,
    /// Cross-unit inputs: input name to `unit.node.output`.
    #[serde(default)]
    pub inputs: BTreeMap<String, UnitOutputRef>,
    /// Published outputs: export name to `node.output`.
    #[serde(default)]
    pub exports: BTreeMap<String, OutputRef>,
    /// Resource nodes of the unit.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Configuration for a single resource node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Node id, unique within the unit.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Explicit dependencies beyond attribute references.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Extra attributes that force replacement.
    #[serde(default)]
    pub replace_on: Vec<String>,
    /// What to do with the provider resource on deletion.
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_parallel() -> usize {
    1
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_allow_replace() -> bool {
    true
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Local,
            endpoint: None,
            path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            replace_strategy: ReplaceStrategy::default(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_deletes: None,
            allow_replace: default_allow_replace(),
        }
    }
}

impl StackConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns unit names in declaration order.
    #[must_use]
    pub fn unit_names(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name.as_str()).collect()
    }

    /// Finds a unit by name.
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<&UnitConfig> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Total number of resources across all units.
    #[must_use]
    pub fn total_resources(&self) -> usize {
        self.units.iter().map(|u| u.resources.len()).sum()
    }

    /// Builds the dependency graph of every unit.
    ///
    /// # Errors
    ///
    /// Returns the first graph construction error.
    pub fn build_units(&self) -> Result<Vec<DeploymentUnit>> {
        self.units.iter().map(UnitConfig::build).collect()
    }
}

impl UnitConfig {
    /// Builds the unit's resource graph.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` or `UnresolvedReference` from the graph builder.
    pub fn build(&self) -> Result<DeploymentUnit> {
        let mut builder = GraphBuilder::new(&self.name).with_inputs(self.inputs.keys().cloned());
        for resource in &self.resources {
            builder.add_node(resource.to_node())?;
        }
        DeploymentUnit::new(builder.build()?, self.inputs.clone(), self.exports.clone())
    }
}

impl ResourceConfig {
    /// Converts this entry into an unlinked resource node.
    #[must_use]
    pub fn to_node(&self) -> ResourceNode {
        let mut node = ResourceNode::new(&self.id, self.kind.clone())
            .with_removal_policy(self.removal_policy);
        node.attributes = self.attributes.clone();
        for dep in &self.depends_on {
            node = node.with_dependency(dep);
        }
        for attribute in &self.replace_on {
            node = node.with_replace_on(attribute);
        }
        node
    }
}

impl ExecutionConfig {
    /// Retry policy for provider calls.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}
