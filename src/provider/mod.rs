//! Provider module for stackplan.
//!
//! A provider performs the actual create, update and delete operations on
//! the external system. The engine only talks to providers through the
//! [`Provider`] trait; two implementations ship with the crate:
//!
//! - [`LocalProvider`]: a simulated cloud kept in memory and optionally
//!   persisted to a JSON file
//! - [`HttpProvider`]: a REST client for a remote provisioning service

mod http;
mod local;
mod retry;

pub use http::HttpProvider;
pub use local::LocalProvider;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::graph::{Outputs, ResourceKind};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Name of the output every provider must return.
pub const ID_OUTPUT: &str = "id";

/// A single provider operation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Unit the resource belongs to.
    pub unit: String,
    /// Node id within the unit.
    pub node_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Fully resolved attributes.
    pub attributes: BTreeMap<String, Value>,
    /// Provider-side id for existing resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
}

/// Operations a provider must support.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource and returns its outputs, including `id`.
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<Outputs>;

    /// Updates an existing resource in place and returns its new outputs.
    async fn update(&self, request: &ResourceRequest) -> ProviderResult<Outputs>;

    /// Deletes a resource.
    ///
    /// Returns `NotFound` if the resource does not exist.
    async fn delete(&self, request: &ResourceRequest) -> ProviderResult<()>;

    /// Reads the current outputs of a resource, `None` if it is gone.
    async fn describe(&self, request: &ResourceRequest) -> ProviderResult<Option<Outputs>>;

    /// Gets the provider name.
    fn name(&self) -> &'static str;
}

impl ResourceRequest {
    /// Creates a request for a resource without a provider-side id yet.
    #[must_use]
    pub fn new(
        unit: impl Into<String>,
        node_id: impl Into<String>,
        kind: ResourceKind,
        attributes: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            unit: unit.into(),
            node_id: node_id.into(),
            kind,
            attributes,
            physical_id: None,
        }
    }

    /// Sets the provider-side id.
    #[must_use]
    pub fn with_physical_id(mut self, id: impl Into<String>) -> Self {
        self.physical_id = Some(id.into());
        self
    }

    /// Returns the provider-side id, failing if the request has none.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no physical id is set.
    pub fn require_physical_id(&self) -> ProviderResult<&str> {
        self.physical_id.as_deref().ok_or_else(|| ProviderError::NotFound {
            kind: self.kind.to_string(),
            id: format!("{}/{}", self.unit, self.node_id),
        })
    }
}

/// Checks that provider outputs carry a physical id.
///
/// # Errors
///
/// Returns `InvalidResponse` if `id` is missing or not a string.
pub fn ensure_id(outputs: Outputs) -> ProviderResult<Outputs> {
    match outputs.get(ID_OUTPUT) {
        Some(Value::String(id)) if !id.is_empty() => Ok(outputs),
        _ => Err(ProviderError::InvalidResponse {
            message: String::from("provider outputs are missing a string 'id'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_physical_id() {
        let request = ResourceRequest::new("app", "fs", ResourceKind::FileSystem, BTreeMap::new());
        assert!(matches!(request.require_physical_id(), Err(ProviderError::NotFound { .. })));

        let request = request.with_physical_id("fs-1");
        assert_eq!(request.require_physical_id().unwrap(), "fs-1");
    }

    #[test]
    fn test_ensure_id() {
        assert!(ensure_id(Outputs::from([(String::from("id"), json!("x"))])).is_ok());
        assert!(ensure_id(Outputs::from([(String::from("id"), json!(1))])).is_err());
        assert!(ensure_id(Outputs::new()).is_err());
    }
}
