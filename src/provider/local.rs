//! In-process simulated provider.
//!
//! Resources live in memory and, when a path is given, are persisted to a
//! JSON file after every change so that consecutive CLI runs see the same
//! simulated cloud.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ProviderError, Result, StackplanError, StateError};
use crate::graph::{Outputs, ResourceKind};

use super::{ID_OUTPUT, Provider, ProviderResult, ResourceRequest};

/// Simulated provider backed by memory and an optional JSON file.
#[derive(Debug)]
pub struct LocalProvider {
    /// Resources by physical id.
    resources: Mutex<BTreeMap<String, LocalResource>>,
    /// File the resources are persisted to.
    path: Option<PathBuf>,
}

/// One simulated resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalResource {
    unit: String,
    node_id: String,
    kind: ResourceKind,
    outputs: Outputs,
}

impl LocalProvider {
    /// Creates a purely in-memory provider.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            resources: Mutex::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Opens a provider persisted at `path`, loading existing resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let resources = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let resources: BTreeMap<String, LocalResource> = serde_json::from_str(&content)
                .map_err(|e| {
                    StackplanError::State(StateError::corrupted(format!(
                        "Failed to parse provider file {}: {e}",
                        path.display()
                    )))
                })?;
            info!("Loaded {} simulated resources from {}", resources.len(), path.display());
            resources
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            resources: Mutex::new(resources),
            path: Some(path),
        })
    }

    /// Number of live resources.
    pub async fn len(&self) -> usize {
        self.resources.lock().await.len()
    }

    /// Returns true if no resources exist.
    pub async fn is_empty(&self) -> bool {
        self.resources.lock().await.is_empty()
    }

    /// Writes the resources to disk, if persistent.
    async fn persist(&self, resources: &BTreeMap<String, LocalResource>) -> ProviderResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(resources)
            .map_err(|e| ProviderError::transient(format!("Failed to encode resources: {e}")))?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::transient(format!("Failed to create directory: {e}")))?;
        }

        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, content)
            .await
            .map_err(|e| ProviderError::transient(format!("Failed to write resources: {e}")))?;
        tokio::fs::rename(&temp, path)
            .await
            .map_err(|e| ProviderError::transient(format!("Failed to replace resources: {e}")))?;

        Ok(())
    }

    /// Builds the outputs the simulated cloud reports for a resource.
    fn outputs(request: &ResourceRequest, physical_id: &str) -> Outputs {
        let mut outputs: Outputs = request.attributes.clone();
        let kind = request.kind.as_str();

        outputs.insert(String::from(ID_OUTPUT), json!(physical_id));
        outputs.insert(
            String::from("arn"),
            json!(format!("arn:stackplan:{kind}:{}:{}/{physical_id}", request.unit, request.node_id)),
        );

        match request.kind {
            ResourceKind::LoadBalancer => {
                outputs.insert(
                    String::from("dns_name"),
                    json!(format!("{}-{physical_id}.lb.stackplan.local", request.node_id)),
                );
            }
            ResourceKind::FileSystem => {
                outputs.insert(String::from("file_system_id"), json!(physical_id));
            }
            ResourceKind::AccessPoint => {
                outputs.insert(String::from("access_point_id"), json!(physical_id));
            }
            ResourceKind::Subnet | ResourceKind::Network => {
                outputs
                    .entry(String::from("cidr"))
                    .or_insert_with(|| Value::String(String::from("10.0.0.0/16")));
            }
            _ => {}
        }

        outputs
    }

    /// Generates a physical id for a new resource.
    fn physical_id(kind: &ResourceKind) -> String {
        let prefix: String = kind
            .as_str()
            .split('-')
            .filter_map(|part| part.chars().next())
            .collect();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{prefix}-{}", &suffix[..12])
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<Outputs> {
        let id = Self::physical_id(&request.kind);
        let outputs = Self::outputs(request, &id);
        debug!("Creating simulated {} '{}' as {id}", request.kind, request.node_id);

        let mut resources = self.resources.lock().await;
        resources.insert(
            id,
            LocalResource {
                unit: request.unit.clone(),
                node_id: request.node_id.clone(),
                kind: request.kind.clone(),
                outputs: outputs.clone(),
            },
        );
        self.persist(&resources).await?;
        Ok(outputs)
    }

    async fn update(&self, request: &ResourceRequest) -> ProviderResult<Outputs> {
        let id = request.require_physical_id()?;
        let mut resources = self.resources.lock().await;

        let Some(resource) = resources.get_mut(id) else {
            return Err(ProviderError::NotFound {
                kind: request.kind.to_string(),
                id: id.to_string(),
            });
        };

        debug!("Updating simulated {} '{}' ({id})", request.kind, request.node_id);
        resource.outputs = Self::outputs(request, id);
        let outputs = resource.outputs.clone();
        self.persist(&resources).await?;
        Ok(outputs)
    }

    async fn delete(&self, request: &ResourceRequest) -> ProviderResult<()> {
        let id = request.require_physical_id()?;
        let mut resources = self.resources.lock().await;

        if resources.remove(id).is_none() {
            return Err(ProviderError::NotFound {
                kind: request.kind.to_string(),
                id: id.to_string(),
            });
        }

        debug!("Deleted simulated {} '{}' ({id})", request.kind, request.node_id);
        self.persist(&resources).await
    }

    async fn describe(&self, request: &ResourceRequest) -> ProviderResult<Option<Outputs>> {
        let id = request.require_physical_id()?;
        let resources = self.resources.lock().await;
        Ok(resources.get(id).map(|r| r.outputs.clone()))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: ResourceKind, node: &str) -> ResourceRequest {
        ResourceRequest::new(
            "compute",
            node,
            kind,
            BTreeMap::from([(String::from("name"), json!(node))]),
        )
    }

    #[tokio::test]
    async fn test_create_reports_kind_outputs() {
        let provider = LocalProvider::in_memory();
        let outputs = provider.create(&request(ResourceKind::LoadBalancer, "lb")).await.unwrap();

        let id = outputs["id"].as_str().unwrap();
        assert!(id.starts_with("lb-"));
        assert!(outputs["dns_name"].as_str().unwrap().starts_with("lb-"));
        assert_eq!(outputs["name"], json!("lb"));
        assert!(outputs["arn"].as_str().unwrap().contains(":load-balancer:compute:lb/"));
    }

    #[tokio::test]
    async fn test_update_and_delete_require_existing() {
        let provider = LocalProvider::in_memory();
        let created = provider.create(&request(ResourceKind::Cluster, "cluster")).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let mut changed = request(ResourceKind::Cluster, "cluster").with_physical_id(&id);
        changed.attributes.insert(String::from("insights"), json!(true));
        let updated = provider.update(&changed).await.unwrap();
        assert_eq!(updated["id"], json!(id));
        assert_eq!(updated["insights"], json!(true));

        provider.delete(&changed).await.unwrap();
        assert!(provider.is_empty().await);
        assert!(matches!(provider.delete(&changed).await, Err(ProviderError::NotFound { .. })));
        assert!(provider.describe(&changed).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.json");

        let provider = LocalProvider::open(&path).await.unwrap();
        let outputs = provider.create(&request(ResourceKind::FileSystem, "fs")).await.unwrap();
        assert_eq!(outputs["file_system_id"], outputs["id"]);

        let reopened = LocalProvider::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        let probe = request(ResourceKind::FileSystem, "fs")
            .with_physical_id(outputs["id"].as_str().unwrap());
        assert!(reopened.describe(&probe).await.unwrap().is_some());
    }
}
