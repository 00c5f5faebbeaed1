//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of attribute maps and whole
//! configurations, so the diff engine can skip field comparison for nodes
//! whose declaration did not change.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::graph::AttributeValue;

use super::spec::{ResourceConfig, StackConfig};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire configuration.
    ///
    /// This hash changes when any part of the configuration changes.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        for unit in &config.units {
            hasher.update(unit.name.as_bytes());
            for (name, source) in &unit.inputs {
                hasher.update(name.as_bytes());
                hasher.update(source.to_string().as_bytes());
            }
            for (name, export) in &unit.exports {
                hasher.update(name.as_bytes());
                hasher.update(export.to_string().as_bytes());
            }
            for resource in &unit.resources {
                hasher.update(self.hash_resource(resource).as_bytes());
            }
        }

        if let Some(guardrails) = &config.guardrails {
            if let Some(max_deletes) = guardrails.max_deletes {
                hasher.update(max_deletes.to_be_bytes());
            }
            hasher.update(if guardrails.allow_replace { [1u8] } else { [0u8] });
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource entry, identity included.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.id.as_bytes());
        hasher.update(resource.kind.as_str().as_bytes());
        hasher.update(self.hash_attributes(&resource.attributes).as_bytes());

        // Dependencies and replace_on are sets, order does not matter
        let mut deps: Vec<&String> = resource.depends_on.iter().collect();
        deps.sort_unstable();
        for dep in deps {
            hasher.update(dep.as_bytes());
        }
        let mut replace_on: Vec<&String> = resource.replace_on.iter().collect();
        replace_on.sort_unstable();
        for attribute in replace_on {
            hasher.update(attribute.as_bytes());
        }

        hasher.update(resource.removal_policy.to_string().as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of declared attributes.
    ///
    /// Keys are hashed in sorted order with length prefixes, values in their
    /// canonical JSON form, so the hash only depends on content.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &BTreeMap<String, AttributeValue>) -> String {
        let mut hasher = Sha256::new();

        for (key, value) in attributes {
            let encoded = Value::from(value.clone()).to_string();
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update((encoded.len() as u64).to_be_bytes());
            hasher.update(encoded.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{RemovalPolicy, ResourceKind};

    fn resource(id: &str) -> ResourceConfig {
        ResourceConfig {
            id: id.to_string(),
            kind: ResourceKind::FileSystem,
            attributes: BTreeMap::from([
                (String::from("encrypted"), AttributeValue::from(true)),
                (String::from("network"), AttributeValue::reference("vpc", "id")),
            ]),
            depends_on: vec![String::from("b"), String::from("a")],
            replace_on: vec![],
            removal_policy: RemovalPolicy::Retain,
        }
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.hash_resource(&resource("fs")), hasher.hash_resource(&resource("fs")));
    }

    #[test]
    fn test_different_resources_different_hash() {
        let hasher = ConfigHasher::new();
        assert_ne!(hasher.hash_resource(&resource("fs-1")), hasher.hash_resource(&resource("fs-2")));
    }

    #[test]
    fn test_dependency_order_ignored() {
        let hasher = ConfigHasher::new();
        let mut reordered = resource("fs");
        reordered.depends_on.reverse();
        assert_eq!(hasher.hash_resource(&resource("fs")), hasher.hash_resource(&reordered));
    }

    #[test]
    fn test_attribute_hash_tracks_values() {
        let hasher = ConfigHasher::new();
        let base = resource("fs").attributes;
        let mut changed = base.clone();
        changed.insert(String::from("encrypted"), AttributeValue::from(false));

        assert_eq!(hasher.hash_attributes(&base), hasher.hash_attributes(&base.clone()));
        assert_ne!(hasher.hash_attributes(&base), hasher.hash_attributes(&changed));
        // A reference and a literal string with the same text differ.
        let mut literal = base.clone();
        literal.insert(String::from("network"), AttributeValue::string("vpc.id"));
        assert_ne!(hasher.hash_attributes(&base), hasher.hash_attributes(&literal));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }
}
